//! Helpers shared by the integration tests

use async_trait::async_trait;
use connect_gateway::error::TunnelError;
use connect_gateway::upstream::BoxedChannel;
use connect_gateway::{TunnelRequest, UpstreamConnector};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Connector that never reaches the network and counts how often it was asked
#[derive(Default)]
pub struct CountingConnector {
    calls: AtomicUsize,
}

impl CountingConnector {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamConnector for CountingConnector {
    async fn connect(&self, request: &TunnelRequest) -> Result<BoxedChannel, TunnelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TunnelError::UpstreamConnect {
            host: request.target_host.clone(),
            port: request.target_port,
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        })
    }
}
