//! Bidirectional forwarding between the two ends of an established tunnel.
//!
//! Each direction runs as its own forwarder. An EOF on one side only shuts
//! the write half of the other, so the reverse direction keeps running
//! until its own source ends. An error, a teardown, or the second forwarder
//! finishing fires the shared cancellation token, and only then are the
//! channels dropped.

use crate::error::TunnelError;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpliceState {
    Open = 0,
    HalfClosing = 1,
    Closed = 2,
}

impl SpliceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SpliceState::Open,
            1 => SpliceState::HalfClosing,
            _ => SpliceState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Upstream => write!(f, "upstream"),
        }
    }
}

#[derive(Debug)]
pub enum CloseReason {
    Eof(Side),
    Error(Side, io::Error),
    Teardown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Eof(side) => write!(f, "{} closed", side),
            CloseReason::Error(side, e) => write!(f, "{} failed: {}", side, e),
            CloseReason::Teardown => write!(f, "torn down"),
        }
    }
}

/// Outcome of a finished tunnel, for logging only.
#[derive(Debug)]
pub struct SpliceReport {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub reason: CloseReason,
}

impl SpliceReport {
    /// `PeerClosed` when one of the ends finished the tunnel, `None` for an external teardown.
    pub fn peer_closed(&self) -> Option<TunnelError> {
        match self.reason {
            CloseReason::Teardown => None,
            _ => Some(TunnelError::PeerClosed),
        }
    }
}

/// Observes and cancels one tunnel from outside the splicer.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    shutdown: CancellationToken,
    state: Arc<AtomicU8>,
}

impl TunnelHandle {
    fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            state: Arc::new(AtomicU8::new(SpliceState::Open as u8)),
        }
    }

    /// Closes both ends. Further calls have no effect.
    pub fn teardown(&self) {
        self.shutdown.cancel();
        self.advance(SpliceState::HalfClosing);
    }

    pub fn state(&self) -> SpliceState {
        SpliceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_torn_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // States only move forward
    fn advance(&self, to: SpliceState) {
        self.state.fetch_max(to as u8, Ordering::AcqRel);
    }

    // True for the direction that leaves `Open`
    fn begin_half_close(&self) -> bool {
        self.state
            .compare_exchange(
                SpliceState::Open as u8,
                SpliceState::HalfClosing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

enum DirectionEnd {
    Eof,
    Error(io::Error),
    Cancelled,
}

struct DirectionReport {
    bytes: u64,
    end: DirectionEnd,
    // Ended before the other direction did
    first: bool,
}

/// The live session. Owns both channels until [`TunnelPair::splice`] returns.
pub struct TunnelPair<C, U> {
    client: C,
    upstream: U,
    handle: TunnelHandle,
}

impl<C, U> TunnelPair<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(client: C, upstream: U) -> Self {
        Self {
            client,
            upstream,
            handle: TunnelHandle::new(),
        }
    }

    pub fn handle(&self) -> TunnelHandle {
        self.handle.clone()
    }

    /// Forwards in both directions until both ends have closed, either end
    /// fails, or the tunnel is torn down. Both channels are released before
    /// this returns.
    pub async fn splice(self) -> SpliceReport {
        let TunnelPair {
            client,
            upstream,
            handle,
        } = self;

        let (client_read, client_write) = tokio::io::split(client);
        let (upstream_read, upstream_write) = tokio::io::split(upstream);

        let (outbound, inbound) = tokio::join!(
            forward(client_read, upstream_write, &handle),
            forward(upstream_read, client_write, &handle),
        );
        handle.shutdown.cancel();
        handle.advance(SpliceState::Closed);

        let (client_to_upstream, upstream_to_client) = (outbound.bytes, inbound.bytes);
        let mut ends = [(Side::Client, outbound), (Side::Upstream, inbound)];
        if ends[1].1.first {
            ends.swap(0, 1);
        }

        // The side that ended first names the reason
        let reason = ends
            .into_iter()
            .find_map(|(side, report)| match report.end {
                DirectionEnd::Eof => Some(CloseReason::Eof(side)),
                DirectionEnd::Error(e) => Some(CloseReason::Error(side, e)),
                DirectionEnd::Cancelled => None,
            })
            .unwrap_or(CloseReason::Teardown);

        SpliceReport {
            client_to_upstream,
            upstream_to_client,
            reason,
        }
    }
}

async fn forward<R, W>(mut reader: R, mut writer: W, handle: &TunnelHandle) -> DirectionReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let step = tokio::select! {
            biased;
            _ = handle.shutdown.cancelled() => None,
            result = copy_chunk(&mut reader, &mut writer, &mut buf) => Some(result),
        };

        match step {
            None => break DirectionEnd::Cancelled,
            Some(Ok(0)) => break DirectionEnd::Eof,
            Some(Ok(n)) => bytes += n as u64,
            Some(Err(e)) => break DirectionEnd::Error(e),
        }
    };

    let first = match end {
        DirectionEnd::Cancelled => false,
        _ => handle.begin_half_close(),
    };

    match end {
        DirectionEnd::Eof => {
            // Half-close: the reverse direction keeps flowing
            tokio::select! {
                biased;
                _ = handle.shutdown.cancelled() => {}
                _ = writer.shutdown() => {}
            }
        }
        DirectionEnd::Error(_) => handle.shutdown.cancel(),
        DirectionEnd::Cancelled => {}
    }

    DirectionReport { bytes, end, first }
}

async fn copy_chunk<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let n = reader.read(buf).await?;
    if n > 0 {
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadBuf, duplex};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_bytes_flow_both_ways_in_order() {
        let (client_side, mut client) = duplex(64);
        let (upstream_side, mut upstream) = duplex(64);

        let pair = TunnelPair::new(client_side, upstream_side);
        let handle = pair.handle();
        let task = tokio::spawn(pair.splice());

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        let mut client = writer.await.unwrap();
        upstream.write_all(b"pong").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
        assert_eq!(handle.state(), SpliceState::Open);

        drop(client);
        let mut buf = [0u8; 1];
        assert_eq!(timeout(WAIT, upstream.read(&mut buf)).await.unwrap().unwrap(), 0);
        drop(upstream);

        let report = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(report.client_to_upstream, 10_000);
        assert_eq!(report.upstream_to_client, 4);
        assert!(matches!(report.reason, CloseReason::Eof(Side::Client)));
        assert_eq!(handle.state(), SpliceState::Closed);
    }

    #[tokio::test]
    async fn test_upstream_close_closes_client() {
        let (client_side, mut client) = duplex(64);
        let (upstream_side, upstream) = duplex(64);

        let task = tokio::spawn(TunnelPair::new(client_side, upstream_side).splice());
        drop(upstream);

        let mut buf = [0u8; 8];
        let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
        drop(client);

        let report = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(report.reason, CloseReason::Eof(Side::Upstream)));
        assert!(matches!(report.peer_closed(), Some(TunnelError::PeerClosed)));
    }

    #[tokio::test]
    async fn test_client_close_closes_upstream() {
        let (client_side, client) = duplex(64);
        let (upstream_side, mut upstream) = duplex(64);

        let task = tokio::spawn(TunnelPair::new(client_side, upstream_side).splice());
        drop(client);

        let mut buf = [0u8; 8];
        let n = timeout(WAIT, upstream.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
        drop(upstream);

        let report = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(report.reason, CloseReason::Eof(Side::Client)));
    }

    /// A client that stops sending still receives the whole reply
    #[tokio::test]
    async fn test_client_half_close_keeps_response() {
        let (client_side, mut client) = duplex(64);
        let (upstream_side, mut upstream) = duplex(64);

        let pair = TunnelPair::new(client_side, upstream_side);
        let handle = pair.handle();
        let task = tokio::spawn(pair.splice());

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        timeout(WAIT, upstream.read_to_end(&mut request)).await.unwrap().unwrap();
        assert_eq!(request, b"ping");
        assert_eq!(handle.state(), SpliceState::HalfClosing);
        assert!(!handle.is_torn_down());

        upstream.write_all(b"pong").await.unwrap();
        drop(upstream);

        let mut response = Vec::new();
        timeout(WAIT, client.read_to_end(&mut response)).await.unwrap().unwrap();
        assert_eq!(response, b"pong");

        let report = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(report.client_to_upstream, 4);
        assert_eq!(report.upstream_to_client, 4);
        assert!(matches!(report.reason, CloseReason::Eof(Side::Client)));
        assert_eq!(handle.state(), SpliceState::Closed);
    }

    /// Write side whose shutdown never completes
    struct StalledShutdown(DuplexStream);

    impl AsyncRead for StalledShutdown {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for StalledShutdown {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_teardown_interrupts_pending_shutdown() {
        let (client_side, _client) = duplex(64);
        let (upstream_side, upstream) = duplex(64);

        let pair = TunnelPair::new(StalledShutdown(client_side), upstream_side);
        let handle = pair.handle();
        let task = tokio::spawn(pair.splice());

        // Upstream EOF starts a client shutdown that never finishes
        drop(upstream);
        timeout(WAIT, async {
            while handle.state() != SpliceState::HalfClosing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.teardown();
        let report = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(report.reason, CloseReason::Eof(Side::Upstream)));
        assert_eq!(handle.state(), SpliceState::Closed);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (client_side, mut client) = duplex(64);
        let (upstream_side, mut upstream) = duplex(64);

        let pair = TunnelPair::new(client_side, upstream_side);
        let handle = pair.handle();
        let task = tokio::spawn(pair.splice());

        handle.teardown();
        handle.teardown();
        let report = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(report.reason, CloseReason::Teardown));
        assert!(report.peer_closed().is_none());
        assert_eq!(handle.state(), SpliceState::Closed);

        // Both channels were released: the peers see EOF
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(upstream.read(&mut buf).await.unwrap(), 0);

        handle.teardown();
        assert!(handle.is_torn_down());
        assert_eq!(handle.state(), SpliceState::Closed);
    }
}
