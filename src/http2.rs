//! HTTP/2 sessions carrying extended CONNECT streams.
//!
//! Every stream is handled independently: one stream's rejection or failure
//! never touches its siblings or the session.

use crate::error::TunnelError;
use crate::establish::establish_multiplexed;
use crate::request::{ExtendedConnect, IncomingRequest};
use crate::server::Gateway;
use crate::splice::TunnelPair;
use bytes::Bytes;
use h2::Reason;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::ext::Protocol;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

/// Runs one HTTP/2 session until the client goes away.
pub async fn serve_connection<IO>(gateway: Gateway, io: IO) -> Result<(), TunnelError>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let service = service_fn(move |req| {
        let gateway = gateway.clone();
        async move { handle_stream(gateway, req).await }
    });

    http2::Builder::new(TokioExecutor::new())
        .enable_connect_protocol()
        .serve_connection(TokioIo::new(io), service)
        .await?;
    Ok(())
}

/// Handles one stream. An `Err` resets the stream with the carried reason.
async fn handle_stream(
    gateway: Gateway,
    mut req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, h2::Error> {
    let connect = ExtendedConnect {
        method: req.method().clone(),
        authority: req.uri().authority().map(|authority| authority.to_string()),
        protocol: req
            .extensions()
            .get::<Protocol>()
            .map(|protocol| protocol.as_str().to_string()),
        headers: req.headers().clone(),
    };

    let request = match gateway.normalize(IncomingRequest::Multiplexed(connect)) {
        Ok(request) => request,
        Err(e @ TunnelError::MethodNotAllowed { .. }) => {
            debug!("Refusing stream: {}", e);
            return Err(Reason::REFUSED_STREAM.into());
        }
        Err(e) => {
            debug!("Rejecting CONNECT stream: {}", e);
            return Ok(rejection(&e));
        }
    };

    let upstream = match gateway.connect_upstream(&request).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("{}", e);
            return Err(Reason::CONNECT_ERROR.into());
        }
    };

    // Resolves once the 200 below has gone out on the stream
    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let client = match on_upgrade.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                warn!("Failed to open stream for tunnel to {}: {}", request.target(), e);
                return;
            }
        };
        info!("{} tunnel established to {}", request.mode, request.target());

        let report = TunnelPair::new(client, upstream).splice().await;
        info!(
            "{} tunnel to {} closed ({}): {} bytes up, {} bytes down",
            request.mode,
            request.target(),
            report.reason,
            report.client_to_upstream,
            report.upstream_to_client
        );
    });

    Ok(establish_multiplexed())
}

/// Final response for a stream rejected before any upstream work; the body
/// carries the reason.
pub fn rejection(error: &TunnelError) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(error.to_string())));
    *response.status_mut() = error.status();
    response
}
