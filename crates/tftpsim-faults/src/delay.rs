//! Late delivery.

use crate::fault::FaultResult;
use crate::stream::{DatagramStream, SharedStream, Trigger};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

/// Holds one datagram back for a fixed delay without blocking later ones
pub struct DelayFault {
    inner: SharedStream,
    trigger: Trigger,
    delay: Duration,
}

impl DelayFault {
    /// Delay datagram number `packet` by `delay`
    pub fn new(inner: SharedStream, packet: u64, delay: Duration) -> Self {
        Self {
            inner,
            trigger: Trigger::new(packet),
            delay,
        }
    }
}

#[async_trait]
impl DatagramStream for DelayFault {
    async fn send(&self, datagram: Vec<u8>) -> FaultResult<()> {
        if !self.trigger.fires(self.inner.sent_count()) {
            return self.inner.send(datagram).await;
        }

        let packet = self.trigger.packet();
        let delay = self.delay;
        let inner = self.inner.clone();
        info!(packet, delay_ms = delay.as_millis() as u64, "delaying datagram");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match inner.send(datagram).await {
                Ok(()) => info!(packet, "delayed datagram sent"),
                Err(e) => warn!(packet, "delayed datagram lost: {e}"),
            }
        });
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::test_support::Harness;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_delayed_datagram_overtaken() {
        let harness = Harness::new().await;
        let chain = harness.chain(Arc::new(DelayFault::new(
            harness.base.clone(),
            2,
            Duration::from_millis(150),
        )));

        let started = std::time::Instant::now();
        for i in 1..=3u8 {
            chain.send(vec![i]).await.unwrap();
        }
        // sends never wait for the held datagram
        assert!(started.elapsed() < Duration::from_millis(100));

        let received = harness.drain(Duration::from_millis(400)).await;
        assert_eq!(received, vec![vec![1], vec![3], vec![2]]);
    }
}
