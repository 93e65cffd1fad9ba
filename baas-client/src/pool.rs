//! Connection pool.
//!
//! Opens up to `max_connections` clients and spreads calls over them
//! round-robin. Clients that have served `max_requests_per_connection`
//! requests, or can no longer write, are evicted and closed once drained.

use crate::breaker::BreakerEvent;
use crate::client::{Client, ClientConfig};
use crate::connection::ConnectionEvent;
use crate::error::ClientError;
use baas_protocol::Request;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Configuration for every pooled client.
    pub client: ClientConfig,
    pub max_connections: usize,
    /// Requests after which a connection is retired.
    pub max_requests_per_connection: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            max_connections: 20,
            max_requests_per_connection: 10_000,
        }
    }
}

impl PoolConfig {
    pub fn new(client: ClientConfig) -> Self {
        Self {
            client,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_max_requests_per_connection(mut self, max: u64) -> Self {
        self.max_requests_per_connection = max.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    MaxRequests,
    NotWritable,
    Error,
}

/// Events observable through [`Pool::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    OpenedConnection,
    Evicted {
        reason: EvictReason,
        request_count: u64,
    },
    ConnectionClosed,
    /// A caller is waiting for a connection to finish opening.
    RequestQueued,
    Error(String),
    BreakerTrip(String),
}

type Waiter = oneshot::Sender<Result<Arc<Client>, ClientError>>;

#[derive(Default)]
struct PoolState {
    ready: VecDeque<Arc<Client>>,
    /// Connections counted against `max_connections`, including ones still
    /// connecting.
    opened: usize,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

impl PoolState {
    /// Removes `client` from the round-robin set. Returns whether it was there.
    fn remove(&mut self, client: &Arc<Client>) -> bool {
        let before = self.ready.len();
        self.ready.retain(|c| !Arc::ptr_eq(c, client));
        let removed = self.ready.len() != before;
        if removed {
            self.opened -= 1;
        }
        removed
    }

    fn next_ready(&mut self) -> Option<Arc<Client>> {
        let client = self.ready.pop_front()?;
        self.ready.push_back(client.clone());
        Some(client)
    }
}

struct Shared {
    config: PoolConfig,
    state: parking_lot::Mutex<PoolState>,
    events: broadcast::Sender<PoolEvent>,
}

impl Shared {
    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    /// Opens one connection for the slot already counted in `opened`.
    ///
    /// Runs as its own task so the slot is settled even when the caller that
    /// asked for it stops waiting. `opener` gets the new client; buffered
    /// waiters are handed ready clients round-robin.
    async fn open(self: Arc<Self>, opener: Waiter) {
        match Client::connect(self.config.client.clone()).await {
            Ok(client) => {
                let client = Arc::new(client);
                self.watch(&client);

                let waiters = {
                    let mut state = self.state.lock();
                    if state.closed {
                        state.opened -= 1;
                        None
                    } else {
                        state.ready.push_back(client.clone());
                        let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
                        let handed: Vec<(Waiter, Arc<Client>)> = waiters
                            .into_iter()
                            .filter_map(|w| state.next_ready().map(|c| (w, c)))
                            .collect();
                        Some(handed)
                    }
                };

                let Some(waiters) = waiters else {
                    client.close().await;
                    let _ = opener.send(Err(ClientError::transport("pool is closed")));
                    return;
                };
                if opener.send(Ok(client)).is_err() {
                    tracing::debug!("Opener stopped waiting, connection kept in the pool");
                }
                for (waiter, ready) in waiters {
                    let _ = waiter.send(Ok(ready));
                }
            }
            Err(err) => {
                tracing::warn!("Failed to open pooled connection: {}", err);
                let waiters: Vec<Waiter> = {
                    let mut state = self.state.lock();
                    state.opened -= 1;
                    state.waiters.drain(..).collect()
                };
                self.emit(PoolEvent::Error(err.to_string()));
                for waiter in waiters {
                    let _ = waiter.send(Err(ClientError::transport(err.to_string())));
                }
                let _ = opener.send(Err(err));
            }
        }
    }

    /// Follows a client's events for as long as it lives.
    fn watch(self: &Arc<Self>, client: &Arc<Client>) {
        let mut conn_events = client.subscribe();
        let mut breaker_events = client.breaker_events();
        let weak_client = Arc::downgrade(client);
        let shared = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = conn_events.recv() => match event {
                        Ok(ConnectionEvent::Error(reason)) => {
                            if !kill(&shared, &weak_client, reason).await {
                                break;
                            }
                        }
                        Ok(ConnectionEvent::Disconnect(_)) => {
                            closed(&shared, &weak_client);
                            break;
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                    event = breaker_events.recv() => match event {
                        Ok(BreakerEvent::Tripped { reason, .. }) => {
                            let Some(shared) = shared.upgrade() else { break };
                            shared.emit(PoolEvent::BreakerTrip(reason));
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

/// A pool of clients to one server. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

enum Next {
    Ready(Arc<Client>),
    Open(Waiter, oneshot::Receiver<Result<Arc<Client>, ClientError>>),
    Wait(oneshot::Receiver<Result<Arc<Client>, ClientError>>),
}

impl Pool {
    /// Creates an empty pool. Connections open on demand.
    ///
    /// Pooled clients never reconnect; a dropped one is replaced instead.
    pub fn new(mut config: PoolConfig) -> Result<Self, ClientError> {
        config.client.resolve()?;
        config.client.reconnect = None;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: parking_lot::Mutex::new(PoolState::default()),
                events,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Hashes `password` on a pooled connection.
    pub async fn hash(&self, password: &str) -> Result<String, ClientError> {
        Request::hash("", password).validate()?;
        self.get_connection().await?.hash(password).await
    }

    /// Checks `password` against `hash` on a pooled connection.
    pub async fn compare(&self, password: &str, hash: &str) -> Result<bool, ClientError> {
        Request::compare("", password, hash).validate()?;
        self.get_connection().await?.compare(password, hash).await
    }

    /// Returns a connection to send on.
    ///
    /// Below `max_connections` this starts opening a new connection and
    /// waits for it. At capacity it hands out ready connections round-robin,
    /// or waits for one still connecting. A caller that stops waiting does
    /// not stop the open.
    pub async fn get_connection(&self) -> Result<Arc<Client>, ClientError> {
        let (next, evicted) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(ClientError::transport("pool is closed"));
            }
            let evicted = self.evict_stale(&mut state);

            let next = if state.opened < self.shared.config.max_connections {
                state.opened += 1;
                let (tx, rx) = oneshot::channel();
                Next::Open(tx, rx)
            } else if let Some(client) = state.next_ready() {
                Next::Ready(client)
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Next::Wait(rx)
            };
            (next, evicted)
        };

        for (client, reason) in evicted {
            self.retire(client, reason).await;
        }

        match next {
            Next::Ready(client) => Ok(client),
            Next::Open(opener, rx) => {
                self.shared.emit(PoolEvent::OpenedConnection);
                tokio::spawn(self.shared.clone().open(opener));
                rx.await
                    .map_err(|_| ClientError::transport("pool closed while opening"))?
            }
            Next::Wait(rx) => {
                tracing::debug!("No ready connection, waiting for one to open");
                self.shared.emit(PoolEvent::RequestQueued);
                rx.await
                    .map_err(|_| ClientError::transport("pool closed while waiting"))?
            }
        }
    }

    fn evict_stale(&self, state: &mut PoolState) -> Vec<(Arc<Client>, EvictReason)> {
        let max_requests = self.shared.config.max_requests_per_connection;
        let mut evicted = Vec::new();
        state.ready.retain(|client| {
            let reason = if client.request_count() >= max_requests {
                EvictReason::MaxRequests
            } else if !client.is_writable() {
                EvictReason::NotWritable
            } else {
                return true;
            };
            evicted.push((client.clone(), reason));
            false
        });
        state.opened -= evicted.len();
        evicted
    }

    async fn retire(&self, client: Arc<Client>, reason: EvictReason) {
        let request_count = client.request_count();
        tracing::warn!(
            ?reason,
            request_count,
            pending = client.pending_requests(),
            "Evicting connection"
        );
        self.shared.emit(PoolEvent::Evicted {
            reason,
            request_count,
        });
        client.close_when_drained().await;
    }

    /// Closes every connection once its pending requests are answered.
    /// Callers waiting for a connection fail.
    pub async fn disconnect(&self) {
        let (clients, waiters) = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            let clients: Vec<Arc<Client>> = state.ready.drain(..).collect();
            state.opened -= clients.len();
            (clients, state.waiters.drain(..).collect::<Vec<_>>())
        };
        tracing::debug!(connections = clients.len(), "Disconnecting pool");

        for waiter in waiters {
            let _ = waiter.send(Err(ClientError::transport("pool closed")));
        }
        for client in clients {
            client.close_when_drained().await;
        }
    }

    /// Connections counted against `max_connections`.
    pub fn opened(&self) -> usize {
        self.shared.state.lock().opened
    }

    /// Connections ready to take requests.
    pub fn ready_count(&self) -> usize {
        self.shared.state.lock().ready.len()
    }

    /// Callers waiting for a connection to open.
    pub fn waiting(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Pool")
            .field("opened", &state.opened)
            .field("ready", &state.ready.len())
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

/// Evicts and closes a client that reported an error. Returns false once the
/// pool or the client is gone.
async fn kill(shared: &Weak<Shared>, client: &Weak<Client>, reason: String) -> bool {
    let (Some(shared), Some(client)) = (shared.upgrade(), client.upgrade()) else {
        return false;
    };
    shared.emit(PoolEvent::Error(reason));

    let removed = shared.state.lock().remove(&client);
    if removed {
        tracing::warn!(request_count = client.request_count(), "Killing errored connection");
        shared.emit(PoolEvent::Evicted {
            reason: EvictReason::Error,
            request_count: client.request_count(),
        });
    }
    client.close().await;
    true
}

fn closed(shared: &Weak<Shared>, client: &Weak<Client>) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    if let Some(client) = client.upgrade() {
        shared.state.lock().remove(&client);
    }
    tracing::debug!("Pooled connection closed");
    shared.emit(PoolEvent::ConnectionClosed);
}
