//! Tokio UDP implementation of [`Transport`].

use crate::TransportConfig;
use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::UdpSocket;

#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

/// Async UDP transport using Tokio.
///
/// Cloning is cheap and yields a handle to the same socket, which is how
/// detached fault tasks get to send on a relay leg while the session loop
/// keeps receiving on it.
///
/// # Examples
///
/// ```no_run
/// use tftpsim_transport::udp_async::AsyncUdpTransport;
/// use tftpsim_transport::transport::Transport;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = AsyncUdpTransport::bind("0.0.0.0:0".parse::<std::net::SocketAddr>()?).await?;
/// println!("ephemeral port {}", transport.local_addr()?.port());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AsyncUdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl AsyncUdpTransport {
    /// Bind a transport with default buffer sizes.
    ///
    /// Use port 0 for an ephemeral port, which is how every transfer
    /// socket picks its TID.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be
    /// created or bound.
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        Self::bind_with_config(addr, &TransportConfig::default()).await
    }

    /// Bind a transport with explicit socket options.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be
    /// created, configured or bound.
    pub async fn bind_with_config<A: Into<SocketAddr>>(
        addr: A,
        config: &TransportConfig,
    ) -> TransportResult<Self> {
        let addr = addr.into();
        let bind_err = |source| TransportError::BindFailed { addr, source };

        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket2 =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(bind_err)?;

        socket2
            .set_recv_buffer_size(config.recv_buffer_size)
            .map_err(bind_err)?;
        socket2
            .set_send_buffer_size(config.send_buffer_size)
            .map_err(bind_err)?;
        if config.reuse_address {
            socket2.set_reuse_address(true).map_err(bind_err)?;
        }

        socket2.bind(&addr.into()).map_err(bind_err)?;
        socket2.set_nonblocking(true).map_err(bind_err)?;

        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = UdpSocket::from_std(std_socket).map_err(bind_err)?;

        Ok(Self::from_socket(socket))
    }

    /// Bind an ephemeral port on the unspecified address of the same
    /// family as `peer`.
    ///
    /// This is the "each reply picks a fresh port" convention: servers,
    /// relays and fault tasks call it to obtain a new TID.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if no port can be bound.
    pub async fn bind_ephemeral_for(peer: SocketAddr) -> TransportResult<Self> {
        let ip = match peer.ip() {
            IpAddr::V4(v4) if v4.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(v6) if v6.is_loopback() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self::bind(SocketAddr::new(ip, 0)).await
    }

    /// Wrap an already-bound Tokio socket.
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }
}

#[async_trait]
impl Transport for AsyncUdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        match self.socket.send_to(buf, addr).await {
            Ok(sent) if sent == buf.len() => {
                self.counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Ok(sent) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::ShortSend {
                    sent,
                    len: buf.len(),
                })
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        match self.socket.recv_from(buf).await {
            Ok((size, addr)) => {
                self.counters
                    .bytes_received
                    .fetch_add(size as u64, Ordering::Relaxed);
                self.counters
                    .packets_received
                    .fetch_add(1, Ordering::Relaxed);
                Ok((size, addr))
            }
            Err(e) => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            recv_errors: self.counters.recv_errors.load(Ordering::Relaxed),
        }
    }
}
