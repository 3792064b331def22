use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{Error, anyhow};
use rustls_native_certs::load_native_certs;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{Connect, TlsConnector};

use confidante_core::xmpp::stream::Connection;

/// A `ClientConfig` trusting the platform's native root certificate store,
/// suitable as the default for dialing out to another server or a client
/// connection's upstream. Mirrors `confidante-backend::settings`'s use of
/// `rustls-native-certs` for the equivalent server-side trust root.
pub fn default_tls_config() -> Result<Arc<ClientConfig>, Error> {
    let mut root_cert_store = RootCertStore::empty();
    for cert in load_native_certs().certs {
        root_cert_store.add(cert)?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Dials `host:port` and wraps the resulting socket as a not-yet-secured
/// `ClientTcpConnection`, ready to be handed to `OutboundStream::new`.
pub async fn connect_tcp(
    host: &str,
    port: u16,
    tls_config: Arc<ClientConfig>,
) -> Result<ClientTcpConnection, Error> {
    let socket = TcpStream::connect((host, port)).await?;
    let server_name = ServerName::try_from(host.to_string())?;

    Ok(ClientTcpConnection::new(socket, tls_config, server_name))
}

enum Socket {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

/// A plain-or-TLS TCP socket dialed outward to a server, upgradeable in
/// place via STARTTLS. The initiator-side counterpart of
/// `confidante-inbound`'s `TcpConnection`.
pub struct ClientTcpConnection {
    socket: Socket,
    tls_config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl ClientTcpConnection {
    pub fn new(
        socket: TcpStream,
        tls_config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Self {
        Self {
            socket: Socket::Plain(socket),
            tls_config,
            server_name,
        }
    }
}

impl Connection for ClientTcpConnection {
    type Upgrade = ClientTcpConnectionUpgrade;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        let Socket::Plain(socket) = self.socket else {
            return Err(anyhow!("connection is already upgraded to TLS"));
        };

        let connect =
            TlsConnector::from(self.tls_config.clone()).connect(self.server_name.clone(), socket);

        Ok(ClientTcpConnectionUpgrade {
            tls_config: self.tls_config,
            server_name: self.server_name,
            connect,
        })
    }

    fn is_starttls_allowed(&self) -> bool {
        matches!(self.socket, Socket::Plain(_))
    }

    fn is_secure(&self) -> bool {
        matches!(self.socket, Socket::Tls(_))
    }

    fn is_authenticated(&self) -> bool {
        false
    }
}

impl AsyncRead for ClientTcpConnection {
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

impl AsyncWrite for ClientTcpConnection {
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

pub struct ClientTcpConnectionUpgrade {
    tls_config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    connect: Connect<TcpStream>,
}

impl Future for ClientTcpConnectionUpgrade {
    type Output = Result<ClientTcpConnection, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.connect).poll(cx) {
            Poll::Ready(Ok(stream)) => Poll::Ready(Ok(ClientTcpConnection {
                socket: Socket::Tls(stream),
                tls_config: this.tls_config.clone(),
                server_name: this.server_name.clone(),
            })),
            Poll::Ready(Err(err)) => Poll::Ready(Err(anyhow!(err))),
            Poll::Pending => Poll::Pending,
        }
    }
}
