//! In-process stand-in for the server, for unit tests.

use baas_protocol::{Encoder, MessageReader, Operation, Request, Response};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

/// What the mock does with one request.
pub(crate) enum Action {
    Reply(Response),
    Ignore,
    Close,
}

pub(crate) struct MockServer {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    /// The accept loop; aborting it drops every connection it spawned.
    task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Stops listening and drops every open connection.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Answers HASH with `hashed:<password>` and COMPARE by checking that form.
pub(crate) fn fake_hasher(request: &Request) -> Action {
    Action::Reply(match request.operation {
        Operation::Hash => Response::hashed(&request.id, format!("hashed:{}", request.password)),
        Operation::Compare => Response::compared(
            &request.id,
            request.hash.as_deref() == Some(&format!("hashed:{}", request.password)),
        ),
    })
}

pub(crate) async fn spawn<F>(respond: F) -> MockServer
where
    F: Fn(&Request) -> Action + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    serve(listener, respond)
}

/// Like [`spawn`], on a fixed address. Retries briefly while a stopped
/// server's socket is released.
pub(crate) async fn spawn_at<F>(addr: SocketAddr, respond: F) -> MockServer
where
    F: Fn(&Request) -> Action + Send + Sync + 'static,
{
    let mut attempts = 0;
    let listener = loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => break listener,
            Err(e) if attempts < 50 => {
                attempts += 1;
                tracing::debug!("Rebinding {} failed: {}", addr, e);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("cannot rebind {}: {}", addr, e),
        }
    };
    serve(listener, respond)
}

fn serve<F>(listener: TcpListener, respond: F) -> MockServer
where
    F: Fn(&Request) -> Action + Send + Sync + 'static,
{
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let respond = Arc::new(respond);

    let counter = accepted.clone();
    let task = tokio::spawn(async move {
        let mut connections = JoinSet::new();
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let respond = respond.clone();
            connections.spawn(async move {
                let (read, mut write) = tokio::io::split(stream);
                let mut reader: MessageReader<_, Request> = MessageReader::new(read);
                while let Some(Ok(request)) = reader.next().await {
                    match respond(&request) {
                        Action::Reply(response) => {
                            let bytes = Encoder::encode_response(&response).unwrap();
                            if write.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                        Action::Ignore => {}
                        Action::Close => return,
                    }
                }
            });
        }
    });

    MockServer {
        addr,
        accepted,
        task,
    }
}
