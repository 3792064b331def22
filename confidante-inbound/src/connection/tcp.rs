use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{Error, anyhow};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::{Accept, TlsAcceptor};

use confidante_core::xmpp::stream::Connection;

enum Socket {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

/// A plain-or-TLS TCP socket, upgradeable in place via STARTTLS.
pub struct TcpConnection {
    socket: Socket,
    tls_config: Arc<ServerConfig>,
    starttls_allowed: bool,
}

impl TcpConnection {
    pub fn new(socket: TcpStream, tls_config: Arc<ServerConfig>, starttls_allowed: bool) -> Self {
        Self {
            socket: Socket::Plain(socket),
            tls_config,
            starttls_allowed,
        }
    }
}

impl Connection for TcpConnection {
    type Upgrade = TcpConnectionUpgrade;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        let Socket::Plain(socket) = self.socket else {
            return Err(anyhow!("connection is already upgraded to TLS"));
        };

        let accept = TlsAcceptor::from(self.tls_config.clone()).accept(socket);

        Ok(TcpConnectionUpgrade {
            tls_config: self.tls_config,
            starttls_allowed: self.starttls_allowed,
            accept,
        })
    }

    fn is_starttls_allowed(&self) -> bool {
        self.starttls_allowed && matches!(self.socket, Socket::Plain(_))
    }

    fn is_secure(&self) -> bool {
        matches!(self.socket, Socket::Tls(_))
    }

    fn is_authenticated(&self) -> bool {
        match &self.socket {
            Socket::Plain(_) => false,
            Socket::Tls(socket) => socket.get_ref().1.peer_certificates().is_some(),
        }
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match &mut this.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_read(cx, buf),
            Socket::Tls(socket) => Pin::new(socket).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match &mut this.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_write(cx, buf),
            Socket::Tls(socket) => Pin::new(socket).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match &mut this.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_flush(cx),
            Socket::Tls(socket) => Pin::new(socket).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match &mut this.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_shutdown(cx),
            Socket::Tls(socket) => Pin::new(socket).poll_shutdown(cx),
        }
    }
}

pub struct TcpConnectionUpgrade {
    tls_config: Arc<ServerConfig>,
    starttls_allowed: bool,
    accept: Accept<TcpStream>,
}

impl Future for TcpConnectionUpgrade {
    type Output = Result<TcpConnection, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.accept).poll(cx) {
            Poll::Ready(Ok(stream)) => Poll::Ready(Ok(TcpConnection {
                socket: Socket::Tls(stream),
                tls_config: this.tls_config.clone(),
                starttls_allowed: this.starttls_allowed,
            })),
            Poll::Ready(Err(err)) => Poll::Ready(Err(anyhow!(err))),
            Poll::Pending => Poll::Pending,
        }
    }
}
