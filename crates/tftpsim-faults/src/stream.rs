//! Datagram streams and the shared packet counter.
//!
//! A fault chain looks like
//!
//! ```text
//! Sequenced ─▶ [fault decorator] ─▶ UdpStream ─▶ socket
//! ```
//!
//! [`Sequenced`] numbers every datagram offered to the chain, so by the
//! time a decorator sees a datagram, `sent_count()` is that datagram's
//! 1-based number. Chains that share one [`PacketCounter`] share one
//! numbering.

use crate::fault::{FaultError, FaultResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tftpsim_transport::{AsyncUdpTransport, MAX_DATAGRAM_SIZE, Transport};
use tracing::trace;

/// A bidirectional datagram endpoint with one current peer
#[async_trait]
pub trait DatagramStream: Send + Sync {
    /// Send one datagram to the current peer
    async fn send(&self, datagram: Vec<u8>) -> FaultResult<()>;

    /// Receive one datagram from anyone
    async fn receive(&self) -> FaultResult<(Vec<u8>, SocketAddr)>;

    /// Number of datagrams offered to the chain so far
    fn sent_count(&self) -> u64;

    /// Where sends go
    fn peer(&self) -> Option<SocketAddr>;

    /// Close the underlying socket
    async fn close(&self) -> FaultResult<()>;
}

/// Shared, type-erased stream
pub type SharedStream = Arc<dyn DatagramStream>;

/// Monotonic 1-based datagram counter shared by a set of chains
#[derive(Debug, Clone, Default)]
pub struct PacketCounter(Arc<AtomicU64>);

impl PacketCounter {
    /// Counter starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Datagrams counted so far
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Count one more datagram and return its number
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Innermost stream: a UDP socket plus a settable peer
pub struct UdpStream {
    transport: Arc<AsyncUdpTransport>,
    peer: RwLock<Option<SocketAddr>>,
    counter: PacketCounter,
}

impl UdpStream {
    /// Wrap `transport`, sending to `peer`
    pub fn new(
        transport: Arc<AsyncUdpTransport>,
        peer: Option<SocketAddr>,
        counter: PacketCounter,
    ) -> Self {
        Self {
            transport,
            peer: RwLock::new(peer),
            counter,
        }
    }

    /// Redirect future sends
    pub fn set_peer(&self, peer: SocketAddr) {
        *self.peer.write().unwrap_or_else(PoisonError::into_inner) = Some(peer);
    }

    /// Local address of the socket
    pub fn local_addr(&self) -> FaultResult<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }
}

#[async_trait]
impl DatagramStream for UdpStream {
    async fn send(&self, datagram: Vec<u8>) -> FaultResult<()> {
        let peer = self.peer().ok_or(FaultError::NoPeer)?;
        self.transport.send_to(&datagram, peer).await?;
        Ok(())
    }

    async fn receive(&self) -> FaultResult<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = self.transport.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((buf, from))
    }

    fn sent_count(&self) -> u64 {
        self.counter.get()
    }

    fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn close(&self) -> FaultResult<()> {
        self.transport.close().await?;
        Ok(())
    }
}

/// Outermost stream: numbers each datagram before passing it on
pub struct Sequenced {
    inner: SharedStream,
    counter: PacketCounter,
}

impl Sequenced {
    /// Number datagrams sent through `inner` with `counter`
    pub fn new(inner: SharedStream, counter: PacketCounter) -> Self {
        Self { inner, counter }
    }
}

#[async_trait]
impl DatagramStream for Sequenced {
    async fn send(&self, datagram: Vec<u8>) -> FaultResult<()> {
        let packet = self.counter.advance();
        trace!(packet, len = datagram.len(), "offering datagram");
        self.inner.send(datagram).await
    }

    async fn receive(&self) -> FaultResult<(Vec<u8>, SocketAddr)> {
        self.inner.receive().await
    }

    fn sent_count(&self) -> u64 {
        self.counter.get()
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer()
    }

    async fn close(&self) -> FaultResult<()> {
        self.inner.close().await
    }
}

/// One-shot trigger armed for a single packet number
#[derive(Debug)]
pub(crate) struct Trigger {
    packet: u64,
    fired: AtomicBool,
}

impl Trigger {
    pub(crate) fn new(packet: u64) -> Self {
        Self {
            packet,
            fired: AtomicBool::new(false),
        }
    }

    pub(crate) fn packet(&self) -> u64 {
        self.packet
    }

    /// True exactly once, for the armed packet number
    pub(crate) fn fires(&self, current: u64) -> bool {
        current == self.packet && !self.fired.swap(true, Ordering::SeqCst)
    }
}
