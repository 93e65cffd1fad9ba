//! # baas-client
//!
//! Client library for baas.
//!
//! This crate provides:
//! - A multiplexed connection that correlates responses by request id
//! - A circuit breaker with a per-call timeout
//! - A round-robin connection pool with request-count based eviction
//! - Optional TLS support

pub mod breaker;
pub mod client;
pub mod connection;
pub mod error;
pub mod pool;
pub mod stream;
pub mod tls;

#[cfg(test)]
mod testing;

pub use breaker::{BreakerConfig, BreakerEvent, BreakerState, CircuitBreaker};
pub use client::{Client, ClientConfig, Endpoint, Protocol, ReconnectConfig};
pub use connection::{Connection, ConnectionConfig, ConnectionEvent, ConnectionState};
pub use error::ClientError;
pub use pool::{EvictReason, Pool, PoolConfig, PoolEvent};
pub use tls::TlsClientConfig;
