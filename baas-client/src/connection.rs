//! Connection management and request correlation.
//!
//! Many requests share one connection. Each gets a connection-local id; a
//! background reader matches responses back to their waiters by that id.

use crate::error::ClientError;
use crate::stream::ClientStream;
use crate::tls::{create_tls_connector, TlsClientConfig};
use baas_protocol::{Encoder, MessageReader, ProtocolError, Request, Response};
use bytes::BytesMut;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default capacity for the connection event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Connection timeout, including the TLS handshake.
    pub connect_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// TLS configuration; `None` means plain TCP.
    pub tls: Option<TlsClientConfig>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            tls: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Closing once the last in-flight request is answered.
    Draining,
    Closed,
}

/// Events observable through [`Connection::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The TCP (and TLS) connection is established.
    Connect,
    /// The connection accepts requests.
    Ready,
    /// The read side ended, with the reason if it was not a clean close.
    Disconnect(Option<String>),
    Error(String),
    /// The last in-flight request was answered.
    Drain,
    Response { request_id: String },
}

/// Work for the writer task.
enum Outgoing {
    Frame(BytesMut, oneshot::Sender<std::io::Result<()>>),
    Shutdown,
}

/// A multiplexed connection to a baas server.
pub struct Connection {
    id: Uuid,
    config: ConnectionConfig,
    /// Feeds the task that owns the write half. Frames are written whole
    /// even if the caller stops waiting.
    writer: parking_lot::Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    /// Waiters keyed by request id.
    pending: DashMap<String, oneshot::Sender<Response>>,
    next_id: AtomicU64,
    request_count: AtomicU64,
    pending_requests: AtomicUsize,
    writable: AtomicBool,
    close_when_drained: AtomicBool,
    state: parking_lot::Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    reader_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            config,
            writer: parking_lot::Mutex::new(None),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            request_count: AtomicU64::new(0),
            pending_requests: AtomicUsize::new(0),
            writable: AtomicBool::new(false),
            close_when_drained: AtomicBool::new(false),
            state: parking_lot::Mutex::new(ConnectionState::Connecting),
            events,
            reader_task: parking_lot::Mutex::new(None),
        }
    }

    /// Subscribes to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Connects to the server and starts the background reader and writer.
    ///
    /// A connection that was dropped by the server may be connected again;
    /// one closed through [`Connection::close`] may not.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_closing() {
            return Err(ClientError::transport("connection was closed"));
        }
        *self.state.lock() = ConnectionState::Connecting;
        let addr = format!("{}:{}", self.config.host, self.config.port);
        tracing::debug!(conn_id = %self.id, "Connecting to {}...", addr);

        let stream = match tokio::time::timeout(self.config.connect_timeout, self.open_stream())
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.fail_connect(e)),
            Err(_) => return Err(self.fail_connect(ClientError::Timeout)),
        };
        self.emit(ConnectionEvent::Connect);

        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(self.id, write_half, outgoing_rx));
        *self.writer.lock() = Some(outgoing);

        let reader = MessageReader::with_buffer_size(read_half, self.config.read_buffer_size);
        let task = tokio::spawn(read_loop(Arc::downgrade(self), reader));
        *self.reader_task.lock() = Some(task);

        *self.state.lock() = ConnectionState::Open;
        self.writable.store(true, Ordering::SeqCst);
        tracing::debug!(conn_id = %self.id, "Connected to {}", addr);
        self.emit(ConnectionEvent::Ready);
        Ok(())
    }

    async fn open_stream(&self) -> Result<ClientStream, ClientError> {
        let tcp_stream =
            TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        tcp_stream.set_nodelay(true).ok();

        match self.config.tls {
            Some(ref tls_config) => {
                let (connector, server_name) = create_tls_connector(tls_config, &self.config.host)?;
                let tls_stream = connector
                    .connect(server_name, tcp_stream)
                    .await
                    .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
                Ok(tls_stream.into())
            }
            None => Ok(tcp_stream.into()),
        }
    }

    fn fail_connect(&self, err: ClientError) -> ClientError {
        tracing::debug!(conn_id = %self.id, "Connection failed: {}", err);
        *self.state.lock() = ConnectionState::Closed;
        self.emit(ConnectionEvent::Error(err.to_string()));
        err
    }

    /// Sends a request and waits for its response.
    ///
    /// The request id is replaced by one unique among this connection's
    /// in-flight requests. A `busy` answer resolves to
    /// [`ClientError::ServerBusy`]. There is no retry.
    pub async fn send(&self, mut request: Request) -> Result<Response, ClientError> {
        request.validate()?;
        if !self.is_writable() {
            return Err(ClientError::transport("connection is not writable"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        tracing::Span::current().record("request_id", id.as_str());
        request.id = id.clone();
        let encoded = Encoder::encode_request(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        self.pending_requests.fetch_add(1, Ordering::SeqCst);

        // Registered before this check, so a concurrent teardown either
        // fails the waiter or is seen here.
        let written = match self.is_writable().then(|| self.enqueue(encoded)).flatten() {
            Some(written) => written,
            None => {
                self.abandon(&id);
                return Err(ClientError::transport("connection is not writable"));
            }
        };
        self.request_count.fetch_add(1, Ordering::SeqCst);

        let failure = match written.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("write failed: {}", e)),
            Err(_) => Some("writer closed".to_string()),
        };
        if let Some(failure) = failure {
            self.writable.store(false, Ordering::SeqCst);
            self.abandon(&id);
            return Err(ClientError::transport(failure));
        }
        tracing::debug!(conn_id = %self.id, request_id = %id, "Request sent");

        let response = rx
            .await
            .map_err(|_| ClientError::transport("connection closed before response"))?;
        if response.busy {
            return Err(ClientError::ServerBusy);
        }
        Ok(response)
    }

    /// Queues a frame for the writer task. The receiver reports the write.
    fn enqueue(&self, frame: BytesMut) -> Option<oneshot::Receiver<std::io::Result<()>>> {
        let (done, written) = oneshot::channel();
        let writer = self.writer.lock();
        writer.as_ref()?.send(Outgoing::Frame(frame, done)).ok()?;
        Some(written)
    }

    /// Drops a waiter that will never be answered.
    fn abandon(&self, id: &str) {
        if let Some((_, remaining)) = self.take_pending(id) {
            self.settle(remaining);
        }
    }

    /// Runs the drain bookkeeping once `remaining` requests are left.
    fn settle(&self, remaining: usize) {
        if remaining == 0 {
            self.emit(ConnectionEvent::Drain);
            if self.close_when_drained.load(Ordering::SeqCst) {
                self.shutdown_writer();
            }
        }
    }

    /// Removes a waiter, decrementing the pending count if it was present.
    fn take_pending(&self, id: &str) -> Option<(oneshot::Sender<Response>, usize)> {
        let (_, tx) = self.pending.remove(id)?;
        let remaining = self.pending_requests.fetch_sub(1, Ordering::SeqCst) - 1;
        Some((tx, remaining))
    }

    fn on_response(&self, response: Response) {
        let request_id = response.request_id.clone();
        let Some((tx, remaining)) = self.take_pending(&request_id) else {
            tracing::warn!(
                conn_id = %self.id,
                request_id = %request_id,
                "Response for unknown request id"
            );
            return;
        };

        // The caller may have stopped waiting; the answer is dropped then.
        let _ = tx.send(response);
        self.emit(ConnectionEvent::Response { request_id });
        self.settle(remaining);
    }

    /// Fails every waiter and marks the connection closed.
    fn on_disconnect(&self, reason: Option<String>) {
        self.writable.store(false, Ordering::SeqCst);
        *self.state.lock() = ConnectionState::Closed;
        self.writer.lock().take();

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let failed = ids
            .iter()
            .filter(|id| self.take_pending(id).is_some())
            .count();

        if let Some(ref reason) = reason {
            self.emit(ConnectionEvent::Error(reason.clone()));
        }
        tracing::debug!(
            conn_id = %self.id,
            failed,
            "Disconnected{}",
            reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default()
        );
        self.emit(ConnectionEvent::Disconnect(reason));
    }

    /// Half-closes the stream once queued frames are written.
    fn shutdown_writer(&self) {
        self.writable.store(false, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Draining;
            }
        }
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.send(Outgoing::Shutdown);
        }
    }

    /// Stops sending and half-closes the connection.
    ///
    /// Requests already sent are still answered; the server closes its side
    /// once they are, which ends the reader.
    pub async fn close(&self) {
        tracing::debug!(conn_id = %self.id, "Closing connection");
        self.close_when_drained.store(true, Ordering::SeqCst);
        self.shutdown_writer();
    }

    /// Closes now if nothing is in flight, otherwise once the last pending
    /// request is answered.
    pub async fn close_when_drained(&self) {
        self.close_when_drained.store(true, Ordering::SeqCst);
        self.writable.store(false, Ordering::SeqCst);
        if self.pending_requests() == 0 {
            self.shutdown_writer();
        } else {
            let mut state = self.state.lock();
            if *state == ConnectionState::Open {
                *state = ConnectionState::Draining;
            }
        }
    }

    /// Returns whether [`Connection::close`] or
    /// [`Connection::close_when_drained`] was called.
    pub fn is_closing(&self) -> bool {
        self.close_when_drained.load(Ordering::SeqCst)
    }

    /// Returns whether new requests can be sent.
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Requests sent over this connection since it opened.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Requests sent and not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.pending_requests.load(Ordering::SeqCst)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Reads responses until the stream ends and hands each to its waiter.
async fn read_loop(conn: Weak<Connection>, mut reader: MessageReader<ReadHalf<ClientStream>, Response>) {
    let reason = loop {
        let next = reader.next().await;
        let Some(conn) = conn.upgrade() else {
            return;
        };
        match next {
            Some(Ok(response)) => conn.on_response(response),
            Some(Err(ProtocolError::Io(e))) => break Some(e.to_string()),
            Some(Err(e)) => {
                tracing::warn!(conn_id = %conn.id, "Malformed frame from server: {}", e);
                break Some(e.to_string());
            }
            None => break None,
        }
    };

    if let Some(conn) = conn.upgrade() {
        conn.on_disconnect(reason);
    }
}

/// Writes frames in order until the stream fails, a shutdown is asked for,
/// or the connection lets go of its sender.
async fn write_loop(
    conn_id: Uuid,
    mut writer: WriteHalf<ClientStream>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(next) = outgoing.recv().await {
        match next {
            Outgoing::Frame(frame, done) => {
                let result = writer.write_all(&frame).await;
                let failed = result.is_err();
                let _ = done.send(result);
                if failed {
                    break;
                }
            }
            Outgoing::Shutdown => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
    tracing::trace!(conn_id = %conn_id, "Writer stopped");
}
