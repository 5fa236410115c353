//! HTTP/1.1 CONNECT handling on a raw byte stream.
//!
//! The head is read by hand rather than through hyper's HTTP/1 server so the
//! replies go out byte for byte as clients of this gateway expect them, and so
//! bytes the client pipelined behind the head are kept for the tunnel.

use crate::error::TunnelError;
use crate::establish::establish_single_stream;
use crate::request::{IncomingRequest, SingleStreamConnect};
use crate::server::Gateway;
use crate::splice::TunnelPair;
use bytes::Bytes;
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use log::{debug, info, warn};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    Take,
};

pub const UNAUTHORIZED: &[u8] = b"HTTP/1.1 403 Unauthorized\r\n\r\n";
pub const LEADING_SLASH: &[u8] = b"HTTP/1.1 406 Leading Slash\r\n\r\n";
pub const METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";
pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
pub const HEADER_TOO_LARGE: &[u8] = b"HTTP/1.1 431 Request Header Fields Too Large\r\n\r\n";

/// Status line sent before closing a rejected handshake. `None` means the
/// connection is closed without a reply.
pub fn rejection_response(error: &TunnelError) -> Option<&'static [u8]> {
    match error {
        e if e.is_auth_failure() => Some(UNAUTHORIZED),
        TunnelError::LeadingSlashRejected { .. } => Some(LEADING_SLASH),
        TunnelError::MethodNotAllowed { .. } => Some(METHOD_NOT_ALLOWED),
        TunnelError::InvalidAuthority(_) | TunnelError::MalformedRequest(_) => Some(BAD_REQUEST),
        TunnelError::HeaderTooLarge { .. } => Some(HEADER_TOO_LARGE),
        _ => None,
    }
}

/// Reads one request head. Whatever the reader buffered past the blank line
/// comes back as `buffered`.
pub async fn read_request_head<IO>(
    reader: &mut BufReader<IO>,
    max_header_size: usize,
) -> Result<SingleStreamConnect, TunnelError>
where
    IO: AsyncRead + Unpin,
{
    let mut limited = (&mut *reader).take(max_header_size as u64);
    let mut line = Vec::new();

    read_line(&mut limited, &mut line, max_header_size).await?;
    let request_line = String::from_utf8_lossy(&line).trim_end().to_string();
    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) => (method, target, version),
        _ => {
            return Err(TunnelError::MalformedRequest(format!(
                "invalid request line: {:?}",
                request_line
            )));
        }
    };
    if !version.starts_with("HTTP/1.") {
        return Err(TunnelError::MalformedRequest(format!(
            "unsupported version: {}",
            version
        )));
    }

    let mut headers = HeaderMap::new();
    loop {
        line.clear();
        read_line(&mut limited, &mut line, max_header_size).await?;

        let trimmed = trim_line_ending(&line);
        if trimmed.is_empty() {
            break;
        }

        let colon = trimmed.iter().position(|&b| b == b':').ok_or_else(|| {
            TunnelError::MalformedRequest(format!(
                "invalid header line: {:?}",
                String::from_utf8_lossy(trimmed)
            ))
        })?;
        let name = HeaderName::from_bytes(trimmed[..colon].trim_ascii())
            .map_err(|e| TunnelError::MalformedRequest(format!("invalid header name: {}", e)))?;
        let value = HeaderValue::from_bytes(trimmed[colon + 1..].trim_ascii())
            .map_err(|e| TunnelError::MalformedRequest(format!("invalid header value: {}", e)))?;
        headers.append(name, value);
    }

    Ok(SingleStreamConnect {
        method: method.to_string(),
        target: target.to_string(),
        headers,
        buffered: Bytes::copy_from_slice(reader.buffer()),
    })
}

async fn read_line<R>(reader: &mut Take<R>, line: &mut Vec<u8>, limit: usize) -> Result<(), TunnelError>
where
    R: AsyncBufRead + Unpin,
{
    reader.read_until(b'\n', line).await?;
    if line.last() != Some(&b'\n') {
        // Either the byte budget ran out mid-line or the peer went away
        return Err(if reader.limit() == 0 {
            TunnelError::HeaderTooLarge { limit }
        } else {
            TunnelError::MalformedRequest("connection closed before end of request head".to_string())
        });
    }
    Ok(())
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Drives one HTTP/1.1 connection: handshake, upstream connect, acknowledgment, splice.
pub async fn serve_connection<IO>(gateway: &Gateway, io: IO) -> Result<(), TunnelError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut reader = BufReader::new(io);

    let request = match read_request_head(&mut reader, gateway.max_header_size()).await {
        Ok(head) => gateway.normalize(IncomingRequest::SingleStream(head)),
        Err(e) => Err(e),
    };
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            reject(reader.get_mut(), &e).await;
            return Err(e);
        }
    };

    // Buffered bytes now live in `request.pending_bytes`
    let mut client = reader.into_inner();

    let mut upstream = match gateway.connect_upstream(&request).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("{}", e);
            let _ = client.shutdown().await;
            return Err(e);
        }
    };

    establish_single_stream(&mut client, &mut upstream, &request.pending_bytes).await?;
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
    report.peer_closed().map_or(Ok(()), Err)
}

async fn reject<IO>(client: &mut IO, error: &TunnelError)
where
    IO: AsyncWrite + Unpin,
{
    match rejection_response(error) {
        Some(response) => {
            debug!("Rejecting CONNECT: {}", error);
            let _ = client.write_all(response).await;
        }
        None => debug!("Closing connection: {}", error),
    }
    let _ = client.shutdown().await;
}
