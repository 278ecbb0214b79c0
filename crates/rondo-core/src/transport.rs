//! Transport abstraction.
//!
//! The server only needs `accept` from its listener and read / write / close
//! from accepted streams. [`TcpAcceptor`] is the plain implementation;
//! [`TlsContext`] wraps accepted streams in a TLS handshake, so one server
//! type and one connection code path cover both.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

/// A bidirectional byte stream for one accepted connection.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Source of accepted connections.
#[async_trait]
pub trait Acceptor: Send + 'static {
    async fn accept(&mut self) -> io::Result<(BoxedTransport, Option<SocketAddr>)>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// TCP listener bound eagerly and registered with the event loop on first
/// accept, so it can be created before the server runs.
#[derive(Debug)]
pub struct TcpAcceptor {
    pending: Option<std::net::TcpListener>,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    pub fn bind(addr: SocketAddr, backlog: i32) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        Self::from_std(socket.into())
    }

    pub fn from_std(listener: std::net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            pending: Some(listener),
            listener: None,
            local_addr,
        })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> io::Result<(BoxedTransport, Option<SocketAddr>)> {
        if self.listener.is_none() {
            let std = self
                .pending
                .take()
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
            self.listener = Some(TcpListener::from_std(std)?);
        }
        let Some(listener) = self.listener.as_ref() else {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        };

        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok((Box::new(stream), Some(peer)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

#[cfg(feature = "tls")]
pub use tls::TlsContext;

#[cfg(feature = "tls")]
mod tls {
    use std::io;
    use std::sync::Arc;

    use tokio_rustls::TlsAcceptor;

    use super::BoxedTransport;

    /// Server-side TLS settings. When installed, every accepted socket
    /// completes a handshake before its request head is read.
    #[derive(Clone)]
    pub struct TlsContext {
        acceptor: TlsAcceptor,
    }

    impl TlsContext {
        pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
            Self {
                acceptor: TlsAcceptor::from(config),
            }
        }

        pub(crate) async fn wrap(&self, io: BoxedTransport) -> io::Result<BoxedTransport> {
            let stream = self.acceptor.accept(io).await?;
            Ok(Box::new(stream))
        }
    }

    impl std::fmt::Debug for TlsContext {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TlsContext").finish_non_exhaustive()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tcp_acceptor_accepts_after_eager_bind() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let addr = acceptor.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let (mut io, peer) = acceptor.accept().await.unwrap();
        assert!(peer.is_some());
        let mut buf = [0u8; 4];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }
}
