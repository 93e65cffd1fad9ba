//! Accepted connection transport: plain TCP or TLS over TCP.

use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

pin_project! {
    /// Byte stream of one accepted connection.
    #[project = ConnStreamProj]
    pub enum ConnStream {
        Plain { #[pin] inner: TcpStream },
        Tls { #[pin] inner: TlsStream<TcpStream> },
    }
}

/// Forwards a poll call to whichever transport is active.
macro_rules! forward {
    ($self:expr, $method:ident $(, $arg:expr)*) => {
        match $self.project() {
            ConnStreamProj::Plain { inner } => inner.$method($($arg),*),
            ConnStreamProj::Tls { inner } => inner.$method($($arg),*),
        }
    };
}

impl ConnStream {
    /// Returns whether this connection is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, ConnStream::Tls { .. })
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            ConnStream::Plain { inner } => inner,
            ConnStream::Tls { inner } => inner.get_ref().0,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Disables Nagle; responses are small and latency matters more than
    /// packet count.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.tcp().set_nodelay(nodelay)
    }
}

impl From<TcpStream> for ConnStream {
    fn from(inner: TcpStream) -> Self {
        ConnStream::Plain { inner }
    }
}

impl From<TlsStream<TcpStream>> for ConnStream {
    fn from(inner: TlsStream<TcpStream>) -> Self {
        ConnStream::Tls { inner }
    }
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        forward!(self, poll_read, cx, buf)
    }
}

impl AsyncWrite for ConnStream {
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
