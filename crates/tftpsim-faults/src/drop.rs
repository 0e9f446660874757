//! Packet loss.

use crate::fault::FaultResult;
use crate::stream::{DatagramStream, SharedStream, Trigger};
use async_trait::async_trait;
use std::net::SocketAddr;
use tracing::info;

/// Silently discards one datagram
pub struct DropFault {
    inner: SharedStream,
    trigger: Trigger,
}

impl DropFault {
    /// Drop datagram number `packet`
    pub fn new(inner: SharedStream, packet: u64) -> Self {
        Self {
            inner,
            trigger: Trigger::new(packet),
        }
    }
}

#[async_trait]
impl DatagramStream for DropFault {
    async fn send(&self, datagram: Vec<u8>) -> FaultResult<()> {
        if self.trigger.fires(self.inner.sent_count()) {
            info!(packet = self.trigger.packet(), len = datagram.len(), "dropping datagram");
            return Ok(());
        }
        self.inner.send(datagram).await
    }

    async fn receive(&self) -> FaultResult<(Vec<u8>, SocketAddr)> {
        self.inner.receive().await
    }

    fn sent_count(&self) -> u64 {
        self.inner.sent_count()
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer()
    }

    async fn close(&self) -> FaultResult<()> {
        self.inner.close().await
    }
}
