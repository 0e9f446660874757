//! Datagram transport abstraction.
//!
//! Every socket in tftpsim (transfer sockets, the server's request
//! listener, both legs of a relay session) talks to the network through
//! the [`Transport`] trait. The only production implementation is
//! [`crate::udp_async::AsyncUdpTransport`]; the trait exists so the
//! reliable socket and the fault streams can be exercised against any
//! datagram endpoint.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// Largest datagram any tftpsim endpoint will read in one call.
///
/// Protocol messages never exceed 516 bytes, but the fault pipeline can
/// pad datagrams, so receive buffers are sized generously.
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport has been closed locally
    #[error("transport is closed")]
    Closed,

    /// Binding the local endpoint failed
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        /// Address that could not be bound
        addr: SocketAddr,
        /// Underlying OS error
        source: io::Error,
    },

    /// A send wrote fewer bytes than the datagram holds
    #[error("short send: {sent} of {len} bytes")]
    ShortSend {
        /// Bytes the OS accepted
        sent: usize,
        /// Datagram length
        len: usize,
    },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async datagram transport.
///
/// All methods take `&self`: a transport is shared (behind an `Arc`)
/// between the task that owns a transfer and any detached fault tasks
/// that send on its behalf, so implementations must tolerate concurrent
/// senders.
///
/// # Examples
///
/// ```no_run
/// use tftpsim_transport::transport::Transport;
/// use tftpsim_transport::udp_async::AsyncUdpTransport;
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = AsyncUdpTransport::bind("127.0.0.1:0".parse::<SocketAddr>()?).await?;
/// transport.send_to(&[0, 4, 0, 1], "127.0.0.1:6969".parse()?).await?;
///
/// let mut buf = vec![0u8; 1500];
/// let (len, from) = transport.recv_from(&mut buf).await?;
/// println!("{len} bytes from {from}");
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to `addr`.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` after [`Transport::close`], or the
    /// OS error if the send fails.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive one datagram into `buf`, returning its length and origin.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` after [`Transport::close`], or the
    /// OS error if the receive fails.
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Local address this transport is bound to.
    ///
    /// # Errors
    /// Returns the OS error if the address cannot be queried.
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Mark the transport closed. Later sends and receives fail with
    /// `TransportError::Closed`.
    ///
    /// # Errors
    /// Implementations may report a failure to release resources.
    async fn close(&self) -> TransportResult<()>;

    /// Whether [`Transport::close`] has been called.
    fn is_closed(&self) -> bool;

    /// Traffic counters for this endpoint.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Datagrams sent
    pub packets_sent: u64,
    /// Datagrams received
    pub packets_received: u64,
    /// Failed sends
    pub send_errors: u64,
    /// Failed receives
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}
