//! # baas-protocol
//!
//! Wire protocol for baas (bcrypt as a service).
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - JSON request/response messages
//! - A lazy per-connection message reader over any `AsyncRead`

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod reader;

pub use codec::{Decoder, Encoder};
pub use error::ProtocolError;
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{Operation, Request, Response, ValidationError};
pub use reader::MessageReader;

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the baas server.
pub const DEFAULT_PORT: u16 = 9485;

/// Maximum frame payload size (1 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;
