use crate::config::GatewayConfig;
use crate::error::TunnelError;
use crate::request::{ProtocolHint, TunnelRequest};
use crate::tls;
use async_trait::async_trait;
use log::debug;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// A duplex byte channel: either end of a tunnel.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Channel for T {}

pub type BoxedChannel = Box<dyn Channel>;

/// Opens the outbound side of a tunnel. One attempt per call, no retries.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, request: &TunnelRequest) -> Result<BoxedChannel, TunnelError>;
}

/// TCP, optionally wrapped in a rustls client session carrying the request's ALPN candidates.
pub struct TransportConnector {
    tls: Arc<ClientConfig>,
    connect_timeout: Option<Duration>,
}

impl TransportConnector {
    pub fn new(tls: ClientConfig, connect_timeout: Option<Duration>) -> Self {
        Self {
            tls: Arc::new(tls),
            connect_timeout,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, TunnelError> {
        let tls = tls::client_config(&config.upstream_ca_files)?;
        Ok(Self::new(tls, config.connect_timeout_secs.map(Duration::from_secs)))
    }

    async fn open(&self, request: &TunnelRequest) -> io::Result<BoxedChannel> {
        let tcp = TcpStream::connect((request.target_host.as_str(), request.target_port)).await?;
        tcp.set_nodelay(true)?;

        match request.protocol_hint {
            ProtocolHint::Plain => Ok(Box::new(tcp)),
            ProtocolHint::Secure => {
                let mut config = (*self.tls).clone();
                config.alpn_protocols = request
                    .alpn_protocols
                    .iter()
                    .filter(|name| !name.is_empty())
                    .map(|name| name.as_bytes().to_vec())
                    .collect();

                let server_name = ServerName::try_from(request.target_host.clone())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let stream = TlsConnector::from(Arc::new(config))
                    .connect(server_name, tcp)
                    .await?;

                let (_, session) = stream.get_ref();
                debug!(
                    "TLS established with {} (alpn: {:?})",
                    request.target(),
                    session
                        .alpn_protocol()
                        .map(|id| String::from_utf8_lossy(id).into_owned())
                );
                Ok(Box::new(stream))
            }
        }
    }
}

#[async_trait]
impl UpstreamConnector for TransportConnector {
    async fn connect(&self, request: &TunnelRequest) -> Result<BoxedChannel, TunnelError> {
        debug!(
            "Connecting to upstream {} over {:?}",
            request.target(),
            request.protocol_hint
        );

        let result = match self.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.open(request)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            },
            None => self.open(request).await,
        };

        result.map_err(|source| TunnelError::UpstreamConnect {
            host: request.target_host.clone(),
            port: request.target_port,
            source,
        })
    }
}
