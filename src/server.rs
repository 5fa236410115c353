//! Listener and per-connection dispatch.
//!
//! One listener serves both tunnel shapes. The first bytes of every
//! connection are checked against the HTTP/2 client preface; matching
//! connections go to the HTTP/2 session, everything else is read as an
//! HTTP/1.1 CONNECT head.

use crate::auth::AuthGate;
use crate::config::GatewayConfig;
use crate::error::TunnelError;
use crate::request::{IncomingRequest, RequestNormalizer, TunnelRequest};
use crate::upstream::{BoxedChannel, TransportConnector, UpstreamConnector};
use crate::{http1, http2, tls};
use bytes::{Buf, Bytes};
use log::{debug, info, warn};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Client connection preface that opens every HTTP/2 connection.
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

struct GatewayInner {
    config: GatewayConfig,
    auth: AuthGate,
    connector: Arc<dyn UpstreamConnector>,
}

/// The tunneling gateway. Cheap to clone; every connection task holds one.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Result<Self, TunnelError> {
        let connector = TransportConnector::from_config(&config)?;
        Self::with_connector(config, Arc::new(connector))
    }

    /// Builds a gateway that opens upstream channels through `connector`.
    pub fn with_connector(
        config: GatewayConfig,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Result<Self, TunnelError> {
        let credentials = config.credential_string().ok_or_else(|| {
            TunnelError::Config("proxy_username and proxy_password must both be set".to_string())
        })?;

        Ok(Self {
            inner: Arc::new(GatewayInner {
                auth: AuthGate::from_credential_string(credentials),
                config,
                connector,
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn max_header_size(&self) -> usize {
        self.inner.config.max_header_size
    }

    pub fn normalize(&self, request: IncomingRequest) -> Result<TunnelRequest, TunnelError> {
        RequestNormalizer::new(&self.inner.auth).normalize(request)
    }

    pub async fn connect_upstream(&self, request: &TunnelRequest) -> Result<BoxedChannel, TunnelError> {
        self.inner.connector.connect(request).await
    }

    /// Binds the configured address and serves until the listener fails.
    pub async fn run(&self) -> Result<(), TunnelError> {
        let addr = self.config().listen_addr;
        info!("Binding TCP listener to: {}", addr);
        let listener = TcpListener::bind(addr).await?;
        self.run_on(listener).await
    }

    /// Serves connections accepted from an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), TunnelError> {
        let config = self.config();
        let acceptor = match (&config.private_key, &config.certificate) {
            (Some(private_key_path), Some(cert_path)) => {
                debug!("Loading TLS certificate from: {}", cert_path);
                debug!("Loading TLS private key from: {}", private_key_path);
                let tls_config = tls::server_config(private_key_path, cert_path)?;
                Some(TlsAcceptor::from(Arc::new(tls_config)))
            }
            _ => None,
        };

        let scheme = if config.tls_enabled() { "https" } else { "http" };
        info!("CONNECT gateway listening on: {}://{}", scheme, listener.local_addr()?);

        loop {
            let (tcp_stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = tcp_stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
            }

            let gateway = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(tcp_stream).await {
                        Ok(tls_stream) => gateway.serve_connection(tls_stream).await,
                        Err(e) => {
                            warn!("Error establishing TLS connection from {}: {}", remote_addr, e);
                            return;
                        }
                    },
                    None => gateway.serve_connection(tcp_stream).await,
                };

                if let Err(e) = result {
                    debug!("Connection from {} ended: {}", remote_addr, e);
                }
            });
        }
    }

    /// Serves one client connection of either protocol to completion.
    pub async fn serve_connection<IO>(&self, mut io: IO) -> Result<(), TunnelError>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let prefix = sniff_preface(&mut io).await?;
        if prefix.is_empty() {
            debug!("Client closed before sending a request");
            return Ok(());
        }

        if prefix.as_ref() == H2_PREFACE {
            http2::serve_connection(self.clone(), Rewind::new(io, prefix)).await
        } else {
            http1::serve_connection(self, Rewind::new(io, prefix)).await
        }
    }
}

/// Reads until the bytes seen either equal the HTTP/2 preface or stop
/// matching it. Everything read is returned so it can be replayed.
async fn sniff_preface<IO>(io: &mut IO) -> io::Result<Bytes>
where
    IO: AsyncRead + Unpin,
{
    let mut prefix = Vec::with_capacity(H2_PREFACE.len());
    let mut buf = [0u8; H2_PREFACE.len()];

    while prefix.len() < H2_PREFACE.len() {
        let n = io.read(&mut buf[..H2_PREFACE.len() - prefix.len()]).await?;
        if n == 0 {
            break;
        }
        prefix.extend_from_slice(&buf[..n]);
        if !H2_PREFACE.starts_with(&prefix) {
            break;
        }
    }

    Ok(Bytes::from(prefix))
}

/// Puts already consumed bytes back in front of a stream.
pub struct Rewind<T> {
    prefix: Option<Bytes>,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(inner: T, prefix: Bytes) -> Self {
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            inner,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix[..n]);
            prefix.advance(n);
            if !prefix.is_empty() {
                self.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
