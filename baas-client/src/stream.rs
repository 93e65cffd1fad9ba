//! Client transport: plain TCP or TLS over TCP.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pin_project! {
    /// Byte stream of one client connection.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] inner: TcpStream },
        Tls { #[pin] inner: TlsStream<TcpStream> },
    }
}

macro_rules! forward {
    ($self:expr, $method:ident $(, $arg:expr)*) => {
        match $self.project() {
            ClientStreamProj::Plain { inner } => inner.$method($($arg),*),
            ClientStreamProj::Tls { inner } => inner.$method($($arg),*),
        }
    };
}

impl ClientStream {
    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }
}

impl From<TcpStream> for ClientStream {
    fn from(inner: TcpStream) -> Self {
        ClientStream::Plain { inner }
    }
}

impl From<TlsStream<TcpStream>> for ClientStream {
    fn from(inner: TlsStream<TcpStream>) -> Self {
        ClientStream::Tls { inner }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        forward!(self, poll_read, cx, buf)
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        forward!(self, poll_write, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        forward!(self, poll_flush, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        forward!(self, poll_shutdown, cx)
    }
}
