// src/connection/stream.rs

//! Transport abstraction for node connections.
//!
//! `NodeStream` lets the connection actor be generic over plain TCP, TLS, Unix
//! domain sockets and caller-supplied transports (used by tests to inject
//! in-memory duplex pipes). The `Connector` trait is the seam through which a
//! connection obtains a fresh stream on every (re)connect.

use crate::core::errors::ClientError;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::{TlsConnector, rustls};
use tracing::debug;

/// Where a connection points to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parses a `host:port` address as found in MOVED/ASK replies and
    /// `CLUSTER SLOTS` output. IPv6 hosts may be bracketed.
    pub fn parse_addr(addr: &str) -> Option<Self> {
        let (host, port) = addr.rsplit_once(':')?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        // CLUSTER NODES appends `@cport` to the address.
        let port = port.split('@').next()?.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Endpoint::tcp(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Any byte stream usable as a custom transport.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// An enum to abstract over the supported stream types.
pub enum NodeStream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    Custom(Box<dyn Transport>),
}

impl fmt::Debug for NodeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            NodeStream::Tcp(_) => "Tcp",
            NodeStream::Tls(_) => "Tls",
            #[cfg(unix)]
            NodeStream::Unix(_) => "Unix",
            NodeStream::Custom(_) => "Custom",
        };
        f.debug_tuple("NodeStream").field(&kind).finish()
    }
}

// --- Trait Implementations for NodeStream ---
// These implementations simply delegate the calls to the underlying stream type.

impl AsyncRead for NodeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NodeStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            NodeStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(unix)]
            NodeStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            NodeStream::Custom(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NodeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            NodeStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            NodeStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(unix)]
            NodeStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            NodeStream::Custom(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            NodeStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            NodeStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(unix)]
            NodeStream::Unix(s) => Pin::new(s).poll_flush(cx),
            NodeStream::Custom(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            NodeStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            NodeStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(unix)]
            NodeStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            NodeStream::Custom(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Produces a fresh stream for an endpoint. Called on every connect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<NodeStream, ClientError>;
}

/// TLS parameters for the default connector.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// Overrides the SNI/verification name; defaults to the endpoint host.
    pub server_name: Option<String>,
}

/// Connects over TCP (optionally wrapped in TLS) or a Unix domain socket.
#[derive(Clone, Default)]
pub struct DefaultConnector {
    tls: Option<(TlsConnector, TlsSettings)>,
}

impl fmt::Debug for DefaultConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultConnector")
            .field("tls", &self.tls.as_ref().map(|(_, s)| s))
            .finish()
    }
}

impl DefaultConnector {
    pub fn plain() -> Self {
        Self { tls: None }
    }

    /// A connector verifying servers against the webpki root store.
    pub fn tls(settings: TlsSettings) -> Self {
        let mut root_cert_store = rustls::RootCertStore::empty();
        root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();
        Self {
            tls: Some((TlsConnector::from(Arc::new(tls_config)), settings)),
        }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<NodeStream, ClientError> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let tcp_stream = TcpStream::connect((host.as_str(), *port)).await?;
                tcp_stream.set_nodelay(true)?;
                let Some((connector, settings)) = &self.tls else {
                    return Ok(NodeStream::Tcp(tcp_stream));
                };

                let name = settings.server_name.as_deref().unwrap_or(host);
                debug!("Establishing TLS session with {endpoint} (server name {name})");
                let domain = rustls::pki_types::ServerName::try_from(name)
                    .map_err(|_| ClientError::Tls(format!("invalid TLS server name '{name}'")))?
                    .to_owned();
                let tls_stream = connector
                    .connect(domain, tcp_stream)
                    .await
                    .map_err(|e| ClientError::Tls(format!("TLS handshake failed: {e}")))?;
                Ok(NodeStream::Tls(Box::new(tls_stream)))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(NodeStream::Unix(
                tokio::net::UnixStream::connect(path).await?,
            )),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(ClientError::InvalidArgument(
                "unix sockets are not supported on this platform".into(),
            )),
        }
    }
}
