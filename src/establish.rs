use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Acknowledges an HTTP/1.1 CONNECT on the client's byte stream, then hands the
/// bytes the client sent ahead of the acknowledgment to the upstream.
pub async fn establish_single_stream<C, U>(
    client: &mut C,
    upstream: &mut U,
    pending_bytes: &[u8],
) -> io::Result<()>
where
    C: AsyncWrite + Unpin,
    U: AsyncWrite + Unpin,
{
    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;

    if !pending_bytes.is_empty() {
        upstream.write_all(pending_bytes).await?;
        upstream.flush().await?;
    }

    Ok(())
}

/// Successful reply to an HTTP/2 CONNECT: no payload, and the stream stays open
/// as the tunnel.
pub fn establish_multiplexed() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::OK;
    response
}
