//! # baas-server
//!
//! bcrypt-as-a-service TCP server.
//!
//! This crate provides:
//! - A worker pool of OS threads fed from a FIFO queue
//! - TCP connection handling with async I/O
//! - Layered configuration (defaults, YAML, environment)
//! - Optional TLS and Prometheus metrics

pub mod config;
pub mod error;
pub mod event;
pub mod hasher;
pub mod metrics;
pub mod server;
pub mod stream;
pub mod tls;
pub mod worker;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig, TlsConfig, WorkersConfig};
pub use error::ServerError;
pub use event::ServerEvent;
pub use hasher::{BcryptHasher, HashError, PasswordHasher, DEFAULT_BCRYPT_COST};
pub use metrics::{run_metrics_server, Metrics};
pub use server::{Server, ServerConfig, ServerStats};
pub use tls::create_tls_acceptor;
pub use worker::{default_worker_count, Completion, Dispatched, WorkerPool, WorkerPoolConfig};
