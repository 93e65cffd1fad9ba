//! Async message reader.
//!
//! Turns one connection's byte stream into a lazy sequence of parsed
//! messages. The sequence ends when the peer closes the stream; a malformed
//! frame ends it with an error.

use crate::codec::Decoder;
use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default socket read size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Reads framed messages of type `T` from `R`.
///
/// [`MessageReader::next`] is cancel safe: dropping its future before it
/// completes loses no bytes, so it can sit in a `tokio::select!` loop.
pub struct MessageReader<R, T> {
    reader: R,
    decoder: Decoder,
    buf: Vec<u8>,
    finished: bool,
    _message: PhantomData<fn() -> T>,
}

impl<R, T> MessageReader<R, T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    pub fn new(reader: R) -> Self {
        Self::with_buffer_size(reader, DEFAULT_READ_BUFFER_SIZE)
    }

    pub fn with_buffer_size(reader: R, buffer_size: usize) -> Self {
        Self {
            reader,
            decoder: Decoder::new(),
            buf: vec![0u8; buffer_size.max(1)],
            finished: false,
            _message: PhantomData,
        }
    }

    /// Returns the next message.
    ///
    /// `None` means the stream closed cleanly on a frame boundary. After an
    /// error or `None`, every later call returns `None`.
    pub async fn next(&mut self) -> Option<Result<T, ProtocolError>> {
        if self.finished {
            return None;
        }

        loop {
            match self.decoder.decode_message::<T>() {
                Ok(Some(message)) => return Some(Ok(message)),
                Ok(None) => {}
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }

            match self.reader.read(&mut self.buf).await {
                Ok(0) => {
                    self.finished = true;
                    if self.decoder.buffered() == 0 {
                        return None;
                    }
                    return Some(Err(ProtocolError::IncompleteFrame {
                        needed: self.decoder.missing_bytes(),
                    }));
                }
                Ok(n) => self.decoder.extend(&self.buf[..n]),
                Err(e) => {
                    self.finished = true;
                    return Some(Err(ProtocolError::Io(e)));
                }
            }
        }
    }

    /// Returns whether the sequence has ended.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}
