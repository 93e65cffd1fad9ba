//! Server lifecycle events.

use std::net::SocketAddr;
use tokio::sync::broadcast;

/// Capacity of the server event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events observable through [`crate::Server::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The listener is bound.
    Started(SocketAddr),
    /// No worker was idle; the request waits in the FIFO queue.
    Queued { request_id: String, queue_len: usize },
    /// A listener-level failure.
    Error(String),
    /// The server stopped accepting connections.
    Closed,
}

pub(crate) fn channel() -> broadcast::Sender<ServerEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Sends an event, ignoring the case where nobody is subscribed.
pub(crate) fn emit(events: &broadcast::Sender<ServerEvent>, event: ServerEvent) {
    let _ = events.send(event);
}
