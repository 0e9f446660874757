//! Duplicate delivery.

use crate::fault::FaultResult;
use crate::stream::{DatagramStream, SharedStream, Trigger};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tftpsim_core::Opcode;
use tracing::{info, warn};

/// Starts a fresh relay session for a duplicated request
pub trait RequestSpawner: Send + Sync {
    /// Handle `request` as if it had just arrived from the same client
    fn spawn_session(&self, request: Vec<u8>);
}

/// Delivers one datagram twice
pub struct DuplicateFault {
    inner: SharedStream,
    trigger: Trigger,
    delay: Duration,
    spawner: Option<Arc<dyn RequestSpawner>>,
}

impl DuplicateFault {
    /// Duplicate datagram number `packet`, the copy following after `delay`
    pub fn new(inner: SharedStream, packet: u64, delay: Duration) -> Self {
        Self {
            inner,
            trigger: Trigger::new(packet),
            delay,
            spawner: None,
        }
    }

    /// Hand duplicated read/write requests to `spawner` instead of
    /// re-sending them on this stream
    #[must_use]
    pub fn with_spawner(mut self, spawner: Arc<dyn RequestSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }
}

fn is_request(datagram: &[u8]) -> bool {
    matches!(datagram, [0, op, ..] if *op == Opcode::Read as u8 || *op == Opcode::Write as u8)
}

#[async_trait]
impl DatagramStream for DuplicateFault {
    async fn send(&self, datagram: Vec<u8>) -> FaultResult<()> {
        if !self.trigger.fires(self.inner.sent_count()) {
            return self.inner.send(datagram).await;
        }

        let packet = self.trigger.packet();
        let copy = datagram.clone();
        self.inner.send(datagram).await?;

        let delay = self.delay;
        match (&self.spawner, is_request(&copy)) {
            (Some(spawner), true) => {
                info!(packet, "duplicating request as a new session");
                let spawner = spawner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    spawner.spawn_session(copy);
                });
            }
            _ => {
                info!(packet, delay_ms = delay.as_millis() as u64, "duplicating datagram");
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = inner.send(copy).await {
                        warn!(packet, "duplicate lost: {e}");
                    }
                });
            }
        }
        Ok(())
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
