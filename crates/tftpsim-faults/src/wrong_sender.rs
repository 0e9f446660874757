//! Transfer-ID spoofing.

use crate::fault::FaultResult;
use crate::stream::{DatagramStream, SharedStream, Trigger};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tftpsim_core::Message;
use tftpsim_transport::{AsyncUdpTransport, Transport};
use tracing::{info, warn};

/// Default wait for the peer's reply to the spoofed copy
pub const DEFAULT_REPLY_WAIT: Duration = Duration::from_secs(2);

/// Forwards one datagram normally and also sends a copy to the same
/// peer from a fresh socket, so the peer sees an unknown transfer ID
pub struct WrongSenderFault {
    inner: SharedStream,
    trigger: Trigger,
    reply_wait: Duration,
}

impl WrongSenderFault {
    /// Spoof datagram number `packet`
    pub fn new(inner: SharedStream, packet: u64) -> Self {
        Self {
            inner,
            trigger: Trigger::new(packet),
            reply_wait: DEFAULT_REPLY_WAIT,
        }
    }

    /// How long the spoofing socket waits for a reply
    #[must_use]
    pub fn with_reply_wait(mut self, wait: Duration) -> Self {
        self.reply_wait = wait;
        self
    }
}

async fn spoof(peer: SocketAddr, datagram: Vec<u8>, wait: Duration, packet: u64) -> FaultResult<()> {
    let impostor = AsyncUdpTransport::bind_ephemeral_for(peer).await?;
    let origin = impostor.local_addr()?;
    impostor.send_to(&datagram, peer).await?;
    info!(packet, %peer, %origin, "sent copy from wrong transfer ID");

    let mut buf = [0u8; 1024];
    match tokio::time::timeout(wait, impostor.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => match Message::decode(&buf[..len]) {
            Ok(reply) => info!(packet, %from, "wrong-sender reply discarded: {reply}"),
            Err(e) => info!(packet, %from, "undecodable wrong-sender reply discarded: {e}"),
        },
        Ok(Err(e)) => warn!(packet, "wrong-sender socket failed: {e}"),
        Err(_) => info!(packet, "no reply to wrong-sender copy"),
    }

    impostor.close().await?;
    Ok(())
}

#[async_trait]
impl DatagramStream for WrongSenderFault {
    async fn send(&self, datagram: Vec<u8>) -> FaultResult<()> {
        let fires = self.trigger.fires(self.inner.sent_count());
        let copy = fires.then(|| datagram.clone());
        // the genuine datagram goes first so the peer binds our transfer ID
        self.inner.send(datagram).await?;

        if let (Some(copy), Some(peer)) = (copy, self.inner.peer()) {
            let packet = self.trigger.packet();
            let wait = self.reply_wait;
            tokio::spawn(async move {
                if let Err(e) = spoof(peer, copy, wait, packet).await {
                    warn!(packet, "wrong-sender copy failed: {e}");
                }
            });
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::test_support::Harness;
    use std::sync::Arc;
    use tftpsim_core::ErrorCode;

    #[tokio::test]
    async fn test_copy_arrives_from_other_origin() {
        let harness = Harness::new().await;
        let chain = harness.chain(Arc::new(
            WrongSenderFault::new(harness.base.clone(), 1).with_reply_wait(Duration::from_millis(300)),
        ));
        let legit_origin = harness.base.local_addr().unwrap();

        chain.send(Message::ack(1).encode()).await.unwrap();

        let mut buf = [0u8; 64];
        let mut origins = Vec::new();
        for _ in 0..2 {
            let (len, from) = tokio::time::timeout(
                Duration::from_millis(300),
                harness.receiver.recv_from(&mut buf),
            )
            .await
            .unwrap()
            .unwrap();
            assert_eq!(Message::decode(&buf[..len]).unwrap(), Message::ack(1));
            origins.push(from);
        }

        assert_eq!(origins[0], legit_origin);
        let impostor = origins[1];
        assert_ne!(impostor, legit_origin);

        // the peer's rejection reaches the impostor socket, not the chain
        let reject = Message::error(ErrorCode::UnknownTid, "Unknown transfer ID").encode();
        harness.receiver.send_to(&reject, impostor).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), harness.base.receive())
                .await
                .is_err()
        );
    }
}
