//! TCP server implementation.

use crate::error::ServerError;
use crate::event::{self, ServerEvent};
use crate::hasher::PasswordHasher;
use crate::metrics::Metrics;
use crate::stream::ConnStream;
use crate::worker::{Completion, WorkerPool, WorkerPoolConfig};
use baas_protocol::{Encoder, MessageReader, Operation, ProtocolError, Request};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

/// Upper bound on a TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Stand-in deadline while the idle timer is disarmed.
const IDLE_DISARMED: Duration = Duration::from_secs(24 * 60 * 60);

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// `host:port` to bind to.
    pub bind_addr: String,
    /// Close connections with nothing in flight after this long without a
    /// request. `None` disables the timeout.
    pub socket_timeout: Option<Duration>,
    /// Worker thread count; `None` uses available parallelism minus one.
    pub workers: Option<usize>,
    /// Bound on the worker wait queue; `None` is unbounded.
    pub max_queue_length: Option<usize>,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("socket_timeout", &self.socket_timeout)
            .field("workers", &self.workers)
            .field("max_queue_length", &self.max_queue_length)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", baas_protocol::DEFAULT_PORT),
            socket_timeout: Some(Duration::from_millis(2000)),
            workers: None,
            max_queue_length: None,
            tls_acceptor: None,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Default::default()
        }
    }

    /// Builds the runtime configuration from a loaded [`crate::Config`].
    pub fn from_config(config: &crate::Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr(),
            socket_timeout: config.network.socket_timeout(),
            workers: config.workers.count,
            max_queue_length: config.workers.max_queue_length,
            tls_acceptor: None,
            metrics: None,
        }
    }

    pub fn with_socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_max_queue_length(mut self, max: usize) -> Self {
        self.max_queue_length = Some(max);
        self
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether TLS is enabled.
    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.workers,
            max_queue_length: self.max_queue_length,
            metrics: self.metrics.clone(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub protocol_errors_total: AtomicU64,
}

/// Password hashing server.
pub struct Server {
    config: ServerConfig,
    hasher: Arc<dyn PasswordHasher>,
    stats: Arc<ServerStats>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, hasher: Arc<dyn PasswordHasher>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            hasher,
            stats: Arc::new(ServerStats::default()),
            events: event::channel(),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Subscribes to server events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Binds the configured address, serves in the background and returns
    /// the bound address.
    pub async fn start(self: Arc<Self>) -> Result<SocketAddr, ServerError> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = self.serve(listener).await {
                tracing::error!("Server stopped: {}", e);
            }
        });
        Ok(addr)
    }

    async fn bind(&self) -> Result<TcpListener, ServerError> {
        match TcpListener::bind(self.config.bind_addr.as_str()).await {
            Ok(listener) => Ok(listener),
            Err(e) => {
                event::emit(&self.events, ServerEvent::Error(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Serves connections from `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        // Subscribe before anything can observe the server as running, so a
        // shutdown sent right after start is not missed.
        let mut shutdown_rx = self.shutdown.subscribe();
        let pool = WorkerPool::start(
            self.config.worker_pool_config(),
            self.hasher.clone(),
            self.events.clone(),
        )?;

        let local_addr = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} ({}, {} workers)",
            local_addr,
            if self.config.tls_enabled() { "TLS" } else { "plain" },
            pool.worker_count()
        );
        event::emit(&self.events, ServerEvent::Started(local_addr));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => self.spawn_connection(tcp_stream, addr, &pool),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                            event::emit(&self.events, ServerEvent::Error(e.to_string()));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        event::emit(&self.events, ServerEvent::Closed);
        Ok(())
    }

    fn spawn_connection(&self, tcp_stream: TcpStream, addr: SocketAddr, pool: &WorkerPool) {
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let pool = pool.clone();
        let stats = self.stats.clone();
        let config = self.config.clone();
        let mut conn_shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let conn_id = Uuid::new_v4();
            let result = match Self::maybe_tls_accept(tcp_stream, config.tls_acceptor.as_deref())
                .await
            {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    tracing::info!(
                        conn_id = %conn_id,
                        tls = stream.is_tls(),
                        "Client connected: {}",
                        addr
                    );
                    Self::handle_connection(
                        stream,
                        conn_id,
                        pool,
                        &config,
                        &stats,
                        &mut conn_shutdown,
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) | Err(ServerError::ShuttingDown) => {}
                Err(e) if e.is_connection_scoped() => {
                    tracing::debug!(conn_id = %conn_id, "Connection {} error: {}", addr, e)
                }
                Err(e) => tracing::warn!(conn_id = %conn_id, "Connection {} error: {}", addr, e),
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            if let Some(ref metrics) = config.metrics {
                metrics.connections_active.dec();
            }
            tracing::info!(conn_id = %conn_id, "Client disconnected: {}", addr);
        });
    }

    /// Optionally performs TLS handshake on the stream.
    async fn maybe_tls_accept(
        tcp_stream: TcpStream,
        acceptor: Option<&TlsAcceptor>,
    ) -> Result<ConnStream, ServerError> {
        match acceptor {
            Some(acceptor) => {
                let tls_stream =
                    tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp_stream))
                        .await
                        .map_err(|_| ServerError::TlsHandshake("handshake timed out".into()))?
                        .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;
                Ok(tls_stream.into())
            }
            None => Ok(tcp_stream.into()),
        }
    }

    /// Handles a single connection.
    ///
    /// Requests are dispatched in arrival order; responses are written as
    /// their workers finish, which may be out of order.
    async fn handle_connection(
        stream: ConnStream,
        conn_id: Uuid,
        pool: WorkerPool,
        config: &ServerConfig,
        stats: &ServerStats,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader: MessageReader<_, Request> = MessageReader::new(read_half);
        let mut in_flight = FuturesUnordered::new();

        let idle_timeout = config.socket_timeout;
        let idle = tokio::time::sleep(idle_timeout.unwrap_or(IDLE_DISARMED));
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::debug!(conn_id = %conn_id, "Shutdown signal received");
                    return Err(ServerError::ShuttingDown);
                }

                Some((request_id, operation, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    let request_id: String = request_id;
                    let completion: Completion = result?;
                    log_completion(conn_id, &request_id, operation, &completion);

                    let bytes = Encoder::encode_response(&completion.response)?;
                    write_half.write_all(&bytes).await?;

                    if in_flight.is_empty() {
                        if reader.is_finished() {
                            tracing::debug!(conn_id = %conn_id, "Drained after client closed");
                            let _ = write_half.shutdown().await;
                            return Ok(());
                        }
                        if let Some(timeout) = idle_timeout {
                            idle.as_mut().reset(tokio::time::Instant::now() + timeout);
                        }
                    }
                }

                message = reader.next(), if !reader.is_finished() => {
                    match message {
                        Some(Ok(request)) => {
                            stats.requests_total.fetch_add(1, Ordering::Relaxed);
                            if let Some(ref metrics) = config.metrics {
                                metrics
                                    .requests_total
                                    .with_label_values(&[request.operation.as_str()])
                                    .inc();
                            }
                            tracing::info!(
                                request_id = %request.id,
                                conn_id = %conn_id,
                                operation = %request.operation,
                                queued = pool.idle_workers() == 0,
                                traced = request.trace_context.is_some(),
                                "Request received"
                            );

                            let request_id = request.id.clone();
                            let operation = request.operation;
                            in_flight.push(
                                pool.dispatch(request)
                                    .map(move |result| (request_id, operation, result)),
                            );
                            if let Some(timeout) = idle_timeout {
                                idle.as_mut().reset(tokio::time::Instant::now() + timeout);
                            }
                        }
                        Some(Err(ProtocolError::Io(e))) => return Err(ServerError::Io(e)),
                        Some(Err(e)) => {
                            stats.protocol_errors_total.fetch_add(1, Ordering::Relaxed);
                            if let Some(ref metrics) = config.metrics {
                                metrics.protocol_errors_total.inc();
                            }
                            tracing::warn!(
                                conn_id = %conn_id,
                                pending = in_flight.len(),
                                "Malformed frame, closing connection: {}",
                                e
                            );
                            return Err(e.into());
                        }
                        None => {
                            tracing::debug!(conn_id = %conn_id, "Connection closed by client");
                            if in_flight.is_empty() {
                                return Ok(());
                            }
                        }
                    }
                }

                _ = &mut idle, if idle_timeout.is_some() && in_flight.is_empty() => {
                    tracing::debug!(conn_id = %conn_id, "Idle timeout");
                    let _ = write_half.shutdown().await;
                    return Ok(());
                }
            }
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

fn log_completion(conn_id: Uuid, request_id: &str, operation: Operation, completion: &Completion) {
    if completion.response.busy {
        tracing::warn!(
            request_id = %request_id,
            conn_id = %conn_id,
            operation = %operation,
            "Request declined, queue full"
        );
        return;
    }
    tracing::info!(
        request_id = %request_id,
        conn_id = %conn_id,
        operation = %operation,
        took_ms = completion.took.as_millis() as u64,
        worker = completion.worker,
        enqueued = completion.enqueued,
        success = completion.response.success,
        "Request done"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::{BcryptHasher, HashError};
    use baas_protocol::{Decoder, Response};
    use tokio::io::AsyncReadExt;

    struct Slow(Duration);

    impl PasswordHasher for Slow {
        fn hash(&self, password: &str) -> Result<String, HashError> {
            std::thread::sleep(self.0);
            Ok(format!("slow:{}", password))
        }

        fn verify(&self, _password: &str, _hash: &str) -> Result<bool, HashError> {
            Ok(true)
        }
    }

    async fn start(config: ServerConfig, hasher: Arc<dyn PasswordHasher>) -> (Arc<Server>, SocketAddr) {
        let server = Arc::new(Server::new(config, hasher));
        let addr = server.clone().start().await.unwrap();
        (server, addr)
    }

    async fn read_response(stream: &mut TcpStream, decoder: &mut Decoder) -> Option<Response> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(response) = decoder.decode_response().unwrap() {
                return Some(response);
            }
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return None;
            }
            decoder.extend(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_server_not_running_before_serve() {
        let server = Server::new(ServerConfig::new("127.0.0.1:0"), Arc::new(BcryptHasher::new(4)));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_hash_over_raw_socket() {
        let (server, addr) = start(
            ServerConfig::new("127.0.0.1:0").with_workers(1),
            Arc::new(BcryptHasher::new(4)),
        )
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let bytes = Encoder::encode_request(&Request::hash("abc", "foobar")).unwrap();
        stream.write_all(&bytes).await.unwrap();

        let mut decoder = Decoder::new();
        let response = read_response(&mut stream, &mut decoder).await.unwrap();
        assert_eq!(response.request_id, "abc");
        assert!(response.success);
        let hash = response.hash.unwrap();
        assert!(hash.starts_with("$2b$04$"));

        let bytes = Encoder::encode_request(&Request::compare("def", "foobar", hash)).unwrap();
        stream.write_all(&bytes).await.unwrap();
        let response = read_response(&mut stream, &mut decoder).await.unwrap();
        assert_eq!(response.request_id, "def");
        assert!(response.success);

        assert_eq!(server.stats().requests_total.load(Ordering::Relaxed), 2);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_responses_follow_completion_order() {
        let (server, addr) = start(
            ServerConfig::new("127.0.0.1:0").with_workers(2),
            Arc::new(Slow(Duration::from_millis(150))),
        )
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(&Encoder::encode_request(&Request::hash("slow", "a")).unwrap());
        wire.extend_from_slice(&Encoder::encode_request(&Request::compare("fast", "b", "x")).unwrap());
        stream.write_all(&wire).await.unwrap();

        let mut decoder = Decoder::new();
        let first = read_response(&mut stream, &mut decoder).await.unwrap();
        let second = read_response(&mut stream, &mut decoder).await.unwrap();
        assert_eq!(first.request_id, "fast");
        assert_eq!(second.request_id, "slow");
        assert_eq!(second.hash.as_deref(), Some("slow:a"));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let (server, addr) = start(
            ServerConfig::new("127.0.0.1:0").with_workers(1),
            Arc::new(BcryptHasher::new(4)),
        )
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(read.is_ok());
        assert!(rest.is_empty());
        assert_eq!(
            server.stats().protocol_errors_total.load(Ordering::Relaxed),
            1
        );

        server.shutdown();
    }

    #[tokio::test]
    async fn test_idle_connection_closed() {
        let (server, addr) = start(
            ServerConfig::new("127.0.0.1:0")
                .with_workers(1)
                .with_socket_timeout(Some(Duration::from_millis(100))),
            Arc::new(BcryptHasher::new(4)),
        )
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(read.is_ok());
        assert!(rest.is_empty());

        server.shutdown();
    }

    #[tokio::test]
    async fn test_idle_timeout_waits_for_in_flight() {
        let (server, addr) = start(
            ServerConfig::new("127.0.0.1:0")
                .with_workers(1)
                .with_socket_timeout(Some(Duration::from_millis(50))),
            Arc::new(Slow(Duration::from_millis(250))),
        )
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let bytes = Encoder::encode_request(&Request::hash("1", "pw")).unwrap();
        stream.write_all(&bytes).await.unwrap();

        let mut decoder = Decoder::new();
        let response = read_response(&mut stream, &mut decoder).await.unwrap();
        assert_eq!(response.request_id, "1");

        server.shutdown();
    }

    #[tokio::test]
    async fn test_half_closed_client_still_answered() {
        let (server, addr) = start(
            ServerConfig::new("127.0.0.1:0").with_workers(1),
            Arc::new(Slow(Duration::from_millis(50))),
        )
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let bytes = Encoder::encode_request(&Request::hash("1", "pw")).unwrap();
        stream.write_all(&bytes).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut decoder = Decoder::new();
        let response = read_response(&mut stream, &mut decoder).await.unwrap();
        assert_eq!(response.request_id, "1");
        assert!(read_response(&mut stream, &mut decoder).await.is_none());

        server.shutdown();
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let server = Arc::new(Server::new(
            ServerConfig::new("127.0.0.1:0").with_workers(1),
            Arc::new(BcryptHasher::new(4)),
        ));
        let mut events = server.subscribe();
        let addr = server.clone().start().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), ServerEvent::Started(addr));
        assert!(server.is_running());

        server.shutdown();
        assert_eq!(events.recv().await.unwrap(), ServerEvent::Closed);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_bind_failure_emits_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let server = Server::new(
            ServerConfig::new(addr.to_string()).with_workers(1),
            Arc::new(BcryptHasher::new(4)),
        );
        let mut events = server.subscribe();
        assert!(server.run().await.is_err());
        assert!(matches!(events.recv().await.unwrap(), ServerEvent::Error(_)));
    }
}
