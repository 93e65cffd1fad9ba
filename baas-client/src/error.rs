//! Client error types.

use baas_protocol::ValidationError;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] baas_protocol::ProtocolError),

    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server busy")]
    ServerBusy,

    #[error("request timeout")]
    Timeout,

    #[error("circuit breaker open")]
    BreakerOpen,

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("server failed to hash the password")]
    HashFailed,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ClientError {
    /// Returns whether a caller may reasonably retry the call.
    ///
    /// Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Transport(_)
                | ClientError::Timeout
                | ClientError::ServerBusy
                | ClientError::BreakerOpen
        )
    }

    /// Returns whether the error says the link to the server is unhealthy.
    /// Only these count toward tripping the circuit breaker.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Timeout)
    }

    pub(crate) fn transport(msg: impl Into<String>) -> Self {
        ClientError::Transport(msg.into())
    }
}
