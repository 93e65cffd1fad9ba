//! High-level client API.

use crate::breaker::{BreakerConfig, BreakerEvent, CircuitBreaker};
use crate::connection::{Connection, ConnectionConfig, ConnectionEvent, ConnectionState};
use crate::error::ClientError;
use crate::tls::TlsClientConfig;
use baas_protocol::{Request, Response, DEFAULT_PORT};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Reconnection backoff for a standalone client.
///
/// Only the transport is re-established; requests that failed with the old
/// link are not resent.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Delay before attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// `baas` for plain TCP, `baass` for TLS.
    pub protocol: String,
    /// `baas://host:port` style address. Takes precedence over
    /// `host`, `port` and `protocol` when set.
    pub uri: Option<String>,
    /// Per-call deadline enforced by the circuit breaker.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Breaker tuning. Its `timeout` is replaced by `request_timeout`.
    pub breaker: BreakerConfig,
    /// Verify the server certificate (TLS only).
    pub reject_unauthorized: bool,
    /// Extra CA certificate to trust (TLS only).
    pub ca_cert_path: Option<PathBuf>,
    /// Server name for SNI and verification; defaults to the host.
    pub server_name: Option<String>,
    /// Re-establish the connection after the server drops it. Off by
    /// default, and always off for pooled clients.
    pub reconnect: Option<ReconnectConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            protocol: Protocol::Plain.scheme().to_string(),
            uri: None,
            request_timeout: Duration::from_millis(2000),
            connect_timeout: Duration::from_secs(10),
            breaker: BreakerConfig::default(),
            reject_unauthorized: true,
            ca_cert_path: None,
            server_name: None,
            reconnect: None,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Configuration from a `baas://` or `baass://` address.
    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_reject_unauthorized(mut self, reject: bool) -> Self {
        self.reject_unauthorized = reject;
        self
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Resolves where and how to connect.
    pub fn resolve(&self) -> Result<Endpoint, ClientError> {
        match self.uri {
            Some(ref uri) => Endpoint::parse(uri),
            None => Ok(Endpoint {
                protocol: Protocol::from_scheme(&self.protocol)?,
                host: self.host.clone(),
                port: self.port,
            }),
        }
    }

    fn connection_config(&self, endpoint: &Endpoint) -> ConnectionConfig {
        let config = ConnectionConfig::new(endpoint.host.clone(), endpoint.port)
            .with_connect_timeout(self.connect_timeout);
        match endpoint.protocol {
            Protocol::Plain => config,
            Protocol::Tls => config.with_tls(TlsClientConfig {
                ca_cert_path: self.ca_cert_path.clone(),
                reject_unauthorized: self.reject_unauthorized,
                server_name: self.server_name.clone(),
            }),
        }
    }
}

/// Transport selected by the address scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Plain,
    Tls,
}

impl Protocol {
    /// Parses `baas` or `baass`, with or without a trailing colon.
    pub fn from_scheme(scheme: &str) -> Result<Self, ClientError> {
        match scheme.trim_end_matches(':').to_ascii_lowercase().as_str() {
            "baas" => Ok(Protocol::Plain),
            "baass" => Ok(Protocol::Tls),
            _ => Err(ClientError::UnknownProtocol(scheme.to_string())),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Plain => "baas",
            Protocol::Tls => "baass",
        }
    }
}

/// A resolved server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parses `scheme://host[:port][/]`. The port defaults to 9485.
    pub fn parse(uri: &str) -> Result<Self, ClientError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| ClientError::InvalidAddress(uri.to_string()))?;
        let protocol = Protocol::from_scheme(scheme)?;
        let authority = rest.trim_end_matches('/');
        if authority.is_empty() || authority.contains('/') {
            return Err(ClientError::InvalidAddress(uri.to_string()));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| ClientError::InvalidAddress(uri.to_string()))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(ClientError::InvalidAddress(uri.to_string())),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        let port = match port {
            Some(p) => p
                .parse()
                .map_err(|_| ClientError::InvalidAddress(uri.to_string()))?,
            None => DEFAULT_PORT,
        };
        if host.is_empty() {
            return Err(ClientError::InvalidAddress(uri.to_string()));
        }

        Ok(Self {
            protocol,
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.protocol.scheme(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.protocol.scheme(), self.host, self.port)
        }
    }
}

/// High-level client for a baas server.
///
/// One client is one connection with a circuit breaker in front of it.
/// Calls may be issued concurrently; they share the connection.
pub struct Client {
    endpoint: Endpoint,
    conn: Arc<Connection>,
    breaker: CircuitBreaker,
    reconnect: Option<ReconnectConfig>,
    supervised: AtomicBool,
}

impl Client {
    /// Creates a client without connecting.
    ///
    /// Fails with [`ClientError::UnknownProtocol`] for an unrecognized scheme.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let endpoint = config.resolve()?;
        let conn = Arc::new(Connection::new(config.connection_config(&endpoint)));
        let breaker = CircuitBreaker::new(
            config
                .breaker
                .clone()
                .with_timeout(config.request_timeout),
        );
        Ok(Self {
            endpoint,
            conn,
            breaker,
            reconnect: config.reconnect,
            supervised: AtomicBool::new(false),
        })
    }

    /// Creates a client and connects it.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let client = Self::new(config)?;
        client.open().await?;
        Ok(client)
    }

    /// Connects to the server.
    ///
    /// With reconnection configured, a later drop by the server starts a
    /// background task that connects again with backoff. It emits `Connect`
    /// and `Ready` once more on success.
    pub async fn open(&self) -> Result<(), ClientError> {
        let events = self.reconnect.as_ref().map(|_| self.conn.subscribe());
        self.conn.connect().await?;
        tracing::debug!(endpoint = %self.endpoint, "Client connected");

        if let (Some(events), Some(config)) = (events, self.reconnect.clone()) {
            if !self.supervised.swap(true, Ordering::SeqCst) {
                tokio::spawn(reconnect_loop(
                    Arc::downgrade(&self.conn),
                    events,
                    config,
                    self.endpoint.to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Hashes `password` on the server.
    pub async fn hash(&self, password: &str) -> Result<String, ClientError> {
        self.hash_with_context(password, None).await
    }

    /// Like [`Client::hash`], carrying an opaque trace context to the server.
    #[tracing::instrument(
        name = "baas.hash",
        skip_all,
        fields(request_id = tracing::field::Empty)
    )]
    pub async fn hash_with_context(
        &self,
        password: &str,
        trace_context: Option<Vec<u8>>,
    ) -> Result<String, ClientError> {
        let request = Request::hash("", password).with_trace_context(trace_context);
        request.validate()?;

        let response = self.send(request).await?;
        match response.hash {
            Some(hash) if response.success => Ok(hash),
            _ => Err(ClientError::HashFailed),
        }
    }

    /// Checks `password` against `hash` on the server.
    ///
    /// A malformed hash compares as `false`.
    pub async fn compare(&self, password: &str, hash: &str) -> Result<bool, ClientError> {
        self.compare_with_context(password, hash, None).await
    }

    #[tracing::instrument(
        name = "baas.compare",
        skip_all,
        fields(request_id = tracing::field::Empty)
    )]
    pub async fn compare_with_context(
        &self,
        password: &str,
        hash: &str,
        trace_context: Option<Vec<u8>>,
    ) -> Result<bool, ClientError> {
        let request = Request::compare("", password, hash).with_trace_context(trace_context);
        request.validate()?;

        let response = self.send(request).await?;
        Ok(response.success)
    }

    async fn send(&self, request: Request) -> Result<Response, ClientError> {
        self.breaker.call(self.conn.send(request)).await
    }

    /// Requests sent over the connection since it opened.
    pub fn request_count(&self) -> u64 {
        self.conn.request_count()
    }

    /// Requests sent and not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.conn.pending_requests()
    }

    pub fn is_writable(&self) -> bool {
        self.conn.is_writable()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Subscribes to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.conn.subscribe()
    }

    /// Subscribes to circuit breaker events.
    pub fn breaker_events(&self) -> broadcast::Receiver<BreakerEvent> {
        self.breaker.subscribe()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Stops sending and closes the connection once the server has answered
    /// what was already sent.
    pub async fn close(&self) {
        self.conn.close().await
    }

    /// Closes once no request is pending.
    pub async fn close_when_drained(&self) {
        self.conn.close_when_drained().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }
}

/// Waits for the connection to drop and connects it again, until it is
/// closed on purpose or dropped.
async fn reconnect_loop(
    conn: Weak<Connection>,
    mut events: broadcast::Receiver<ConnectionEvent>,
    config: ReconnectConfig,
    endpoint: String,
) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Disconnect(_)) => {}
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        }

        let mut attempt = 0;
        loop {
            let delay = config.delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;

            let Some(conn) = conn.upgrade() else { return };
            if conn.is_closing() {
                tracing::debug!(endpoint = %endpoint, "Connection closed, not reconnecting");
                return;
            }
            match conn.connect().await {
                Ok(()) => {
                    tracing::info!(endpoint = %endpoint, attempt, "Reconnected");
                    break;
                }
                Err(e) => tracing::warn!(
                    endpoint = %endpoint,
                    attempt,
                    "Reconnect failed, retrying in {:?}: {}",
                    config.delay(attempt),
                    e
                ),
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.endpoint)
            .field("id", &self.conn.id())
            .field("state", &self.conn.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::testing::{self, Action};
    use baas_protocol::{Operation, ValidationError};

    async fn connect(addr: std::net::SocketAddr) -> Client {
        Client::connect(ClientConfig::new("127.0.0.1", addr.port()))
            .await
            .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 9485);
        assert_eq!(config.protocol, "baas");
        assert_eq!(config.request_timeout, Duration::from_millis(2000));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.reject_unauthorized);

        let endpoint = config.resolve().unwrap();
        assert_eq!(endpoint.protocol, Protocol::Plain);
        assert_eq!(endpoint.to_string(), "baas://localhost:9485");
    }

    #[test]
    fn test_parse_uri() {
        let endpoint = Endpoint::parse("baas://example.com:1234").unwrap();
        assert_eq!(endpoint.protocol, Protocol::Plain);
        assert_eq!(endpoint.host, "example.com");
        assert_eq!(endpoint.port, 1234);

        let endpoint = Endpoint::parse("baass://example.com/").unwrap();
        assert_eq!(endpoint.protocol, Protocol::Tls);
        assert_eq!(endpoint.port, DEFAULT_PORT);

        let endpoint = Endpoint::parse("baas://[::1]:9000").unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, 9000);
        assert_eq!(endpoint.to_string(), "baas://[::1]:9000");
    }

    #[test]
    fn test_parse_uri_errors() {
        assert!(matches!(
            Endpoint::parse("http://example.com"),
            Err(ClientError::UnknownProtocol(_))
        ));
        assert!(matches!(
            Endpoint::parse("example.com:9485"),
            Err(ClientError::InvalidAddress(_))
        ));
        assert!(matches!(
            Endpoint::parse("baas://host:notaport"),
            Err(ClientError::InvalidAddress(_))
        ));
        assert!(matches!(
            Endpoint::parse("baas://"),
            Err(ClientError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_protocol_scheme() {
        assert_eq!(Protocol::from_scheme("baas:").unwrap(), Protocol::Plain);
        assert_eq!(Protocol::from_scheme("BAASS").unwrap(), Protocol::Tls);
    }

    #[test]
    fn test_unknown_protocol_fails_construction() {
        let err = Client::new(ClientConfig::default().with_protocol("ftp")).unwrap_err();
        assert!(matches!(err, ClientError::UnknownProtocol(ref p) if p == "ftp"));

        let err = Client::new(ClientConfig::from_uri("https://localhost")).unwrap_err();
        assert!(matches!(err, ClientError::UnknownProtocol(_)));
    }

    #[test]
    fn test_request_timeout_drives_breaker() {
        let client = Client::new(
            ClientConfig::default().with_request_timeout(Duration::from_millis(250)),
        )
        .unwrap();
        assert_eq!(client.breaker().config().timeout, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_hash_and_compare() {
        let server = testing::spawn(testing::fake_hasher).await;
        let client = connect(server.addr).await;

        let hash = tokio_test::assert_ok!(client.hash("secret").await);
        assert_eq!(hash, "hashed:secret");
        assert!(client.compare("secret", &hash).await.unwrap());
        assert!(!client.compare("other", &hash).await.unwrap());
        assert_eq!(client.request_count(), 3);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_validation_is_local() {
        let server = testing::spawn(testing::fake_hasher).await;
        let client = connect(server.addr).await;

        assert!(matches!(
            client.hash("").await,
            Err(ClientError::Validation(ValidationError::MissingPassword))
        ));
        assert!(matches!(
            client.compare("pw", "").await,
            Err(ClientError::Validation(ValidationError::MissingHash))
        ));
        assert!(matches!(
            client.compare("", "hash").await,
            Err(ClientError::Validation(ValidationError::MissingPassword))
        ));
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_trace_context_reaches_server() {
        let server = testing::spawn(|req: &Request| {
            let seen = req.trace_context.clone().unwrap_or_default();
            Action::Reply(Response::hashed(&req.id, format!("{:?}", seen)))
        })
        .await;
        let client = connect(server.addr).await;

        let hash = client
            .hash_with_context("pw", Some(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(hash, "[1, 2, 3]");
    }

    #[tokio::test]
    async fn test_failed_hash() {
        let server = testing::spawn(|req: &Request| Action::Reply(Response::failed(&req.id))).await;
        let client = connect(server.addr).await;

        assert!(matches!(client.hash("pw").await, Err(ClientError::HashFailed)));
        assert!(!client.compare("pw", "hash").await.unwrap());
    }

    #[tokio::test]
    async fn test_busy_surfaces() {
        let server = testing::spawn(|req: &Request| match req.operation {
            Operation::Hash => Action::Reply(Response::busy(&req.id)),
            Operation::Compare => Action::Reply(Response::compared(&req.id, true)),
        })
        .await;
        let client = connect(server.addr).await;

        assert!(matches!(client.hash("pw").await, Err(ClientError::ServerBusy)));
        assert_eq!(client.pending_requests(), 0);
        assert_eq!(client.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_timeouts_trip_breaker() {
        let server = testing::spawn(|_: &Request| Action::Ignore).await;
        let config = ClientConfig::new("127.0.0.1", server.addr.port())
            .with_request_timeout(Duration::from_millis(20))
            .with_breaker(
                BreakerConfig::default()
                    .with_failure_threshold(2)
                    .with_cooldown(Duration::from_secs(5)),
            );
        let client = Client::connect(config).await.unwrap();
        let mut breaker_events = client.breaker_events();

        assert!(matches!(client.hash("a").await, Err(ClientError::Timeout)));
        assert!(matches!(client.hash("b").await, Err(ClientError::Timeout)));
        assert!(matches!(
            breaker_events.recv().await.unwrap(),
            BreakerEvent::Tripped { failures: 2, .. }
        ));
        assert!(matches!(client.hash("c").await, Err(ClientError::BreakerOpen)));

        // Timed-out calls still occupy the connection.
        assert_eq!(client.request_count(), 2);
        assert_eq!(client.pending_requests(), 2);
    }

    #[tokio::test]
    async fn test_close_rejects_new_calls() {
        let server = testing::spawn(testing::fake_hasher).await;
        let client = connect(server.addr).await;
        let mut events = client.subscribe();

        client.close().await;
        assert!(!client.is_writable());
        assert!(matches!(client.hash("pw").await, Err(ClientError::Transport(_))));
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnect(None));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_reconnect_backoff() {
        let config = ReconnectConfig::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1));
        assert_eq!(config.delay(0), Duration::from_millis(100));
        assert_eq!(config.delay(1), Duration::from_millis(200));
        assert_eq!(config.delay(3), Duration::from_millis(800));
        assert_eq!(config.delay(4), Duration::from_secs(1));
        assert_eq!(config.delay(u32::MAX), Duration::from_secs(1));

        assert!(ClientConfig::default().reconnect.is_none());
    }

    async fn next_event(
        events: &mut broadcast::Receiver<ConnectionEvent>,
        want: ConnectionEvent,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while events.recv().await.unwrap() != want {}
        })
        .await
        .unwrap_or_else(|_| panic!("no {:?} event", want));
    }

    #[tokio::test]
    async fn test_reconnects_after_server_restart() {
        let server = testing::spawn(testing::fake_hasher).await;
        let addr = server.addr;
        let config = ClientConfig::new("127.0.0.1", addr.port()).with_reconnect(
            ReconnectConfig::default()
                .with_initial_delay(Duration::from_millis(20))
                .with_max_delay(Duration::from_millis(100)),
        );
        let client = Client::connect(config).await.unwrap();
        let mut events = client.subscribe();
        assert_eq!(client.hash("before").await.unwrap(), "hashed:before");

        server.stop().await;
        next_event(&mut events, ConnectionEvent::Disconnect(None)).await;
        assert!(matches!(client.hash("down").await, Err(ClientError::Transport(_))));

        let server = testing::spawn_at(addr, testing::fake_hasher).await;
        next_event(&mut events, ConnectionEvent::Connect).await;
        next_event(&mut events, ConnectionEvent::Ready).await;

        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(client.hash("after").await.unwrap(), "hashed:after");
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn test_no_reconnect_after_close() {
        let server = testing::spawn(testing::fake_hasher).await;
        let config = ClientConfig::new("127.0.0.1", server.addr.port()).with_reconnect(
            ReconnectConfig::default().with_initial_delay(Duration::from_millis(10)),
        );
        let client = Client::connect(config).await.unwrap();
        let mut events = client.subscribe();

        client.close().await;
        next_event(&mut events, ConnectionEvent::Disconnect(None)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn test_no_reconnect_by_default() {
        let server = testing::spawn(|req: &Request| match req.password.as_str() {
            "drop" => Action::Close,
            _ => testing::fake_hasher(req),
        })
        .await;
        let client = connect(server.addr).await;
        let mut events = client.subscribe();

        assert!(matches!(client.hash("drop").await, Err(ClientError::Transport(_))));
        next_event(&mut events, ConnectionEvent::Disconnect(None)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = Client::connect(ClientConfig::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
    }
}
