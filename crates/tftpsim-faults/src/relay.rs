//! Fault-injecting relay.
//!
//! Clients send their requests to the relay instead of the server. For
//! every request the relay opens a session with two fresh sockets: a
//! client-facing leg that talks to the client and a server-facing leg
//! that talks to the server. Datagrams are forwarded between the legs,
//! and the configured fault (if any) wraps the send path of both legs
//! with a shared packet numbering:
//!
//! ```text
//! client ◀──▶ [client leg] ◀── relay session ──▶ [server leg] ◀──▶ server
//!                 #2, #4, ...                         #1, #3, ...
//! ```
//!
//! Packet #1 is always the forwarded request.

use crate::duplicate::RequestSpawner;
use crate::fault::{FaultResult, FaultSpec};
use crate::stream::{DatagramStream, PacketCounter, Sequenced, SharedStream, UdpStream};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tftpsim_core::{BLOCK_SIZE, DEFAULT_RELAY_PORT, DEFAULT_SERVER_PORT, Message};
use tftpsim_transport::{
    AsyncUdpTransport, MAX_DATAGRAM_SIZE, Step, Transport, TransportConfig, TransportError, Worker,
};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address clients send requests to
    pub bind_addr: SocketAddr,
    /// Server requests are forwarded to
    pub server_addr: SocketAddr,
    /// Session ends after this long without traffic on either leg
    pub idle_timeout: Duration,
    /// Quiet period kept after a transfer's final exchange, so late
    /// retransmissions still get through
    pub linger: Duration,
    /// Fault applied to new sessions
    pub fault: Option<FaultSpec>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_RELAY_PORT)),
            server_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_SERVER_PORT)),
            idle_timeout: Duration::from_secs(15),
            linger: Duration::from_secs(3),
            fault: None,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The final data block and its ack went through
    Completed,
    /// An `Error` message went through
    Errored,
    /// Nothing moved for the idle timeout
    Idle,
}

struct RelayShared {
    server_addr: SocketAddr,
    idle_timeout: Duration,
    linger: Duration,
    fault: RwLock<Option<FaultSpec>>,
    next_session: AtomicU64,
    active: AtomicUsize,
}

/// A running relay
pub struct Relay {
    local_addr: SocketAddr,
    listener: Arc<AsyncUdpTransport>,
    shared: Arc<RelayShared>,
    worker: Worker,
}

impl Relay {
    /// Bind the listening socket and start accepting requests
    pub async fn bind(config: RelayConfig) -> FaultResult<Self> {
        let transport_config = TransportConfig {
            reuse_address: true,
            ..TransportConfig::default()
        };
        let listener =
            Arc::new(AsyncUdpTransport::bind_with_config(config.bind_addr, &transport_config).await?);
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(RelayShared {
            server_addr: config.server_addr,
            idle_timeout: config.idle_timeout,
            linger: config.linger,
            fault: RwLock::new(config.fault),
            next_session: AtomicU64::new(1),
            active: AtomicUsize::new(0),
        });

        let worker = {
            let listener = listener.clone();
            let shared = shared.clone();
            Worker::spawn("relay", move || {
                let listener = listener.clone();
                let shared = shared.clone();
                async move { shared.accept_one(&listener).await }
            })
        };

        info!(addr = %local_addr, server = %config.server_addr, "relay listening");
        Ok(Self {
            local_addr,
            listener,
            shared,
            worker,
        })
    }

    /// Listening address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Fault applied to sessions started from now on (`None` clears it)
    pub async fn set_fault(&self, fault: Option<FaultSpec>) {
        match &fault {
            Some(spec) => info!(fault = %spec, "fault armed"),
            None => info!("fault cleared"),
        }
        *self.shared.fault.write().await = fault;
    }

    /// Currently configured fault
    pub async fn fault(&self) -> Option<FaultSpec> {
        self.shared.fault.read().await.clone()
    }

    /// Sessions currently forwarding
    pub fn active_sessions(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Stop accepting requests. Running sessions finish on their own.
    /// Returns the number of sessions still running.
    pub async fn shutdown(self) -> usize {
        self.worker.stop();
        if let Err(e) = self.listener.close().await {
            debug!("listener close failed: {e}");
        }
        if let Err(e) = self.worker.join().await {
            warn!("{e}");
        }
        let active = self.shared.active.load(Ordering::SeqCst);
        info!(active, "relay stopped");
        active
    }
}

impl RelayShared {
    async fn accept_one(self: &Arc<Self>, listener: &AsyncUdpTransport) -> FaultResult<Step> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, client) = match listener.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(TransportError::Closed) => return Ok(Step::Stop),
            Err(e) => return Err(e.into()),
        };
        buf.truncate(len);

        match Message::decode(&buf) {
            Ok(request @ Message::Request { .. }) => {
                let fault = self.fault.read().await.clone();
                debug!(%client, "{request}");
                self.start_session(client, buf, fault);
            }
            Ok(other) => debug!(%client, "ignoring {other} on listening port"),
            Err(e) => debug!(%client, "ignoring undecodable datagram: {e}"),
        }
        Ok(Step::Continue)
    }

    fn start_session(self: &Arc<Self>, client: SocketAddr, request: Vec<u8>, fault: Option<FaultSpec>) {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        let shared = self.clone();

        tokio::spawn(async move {
            let session = Session {
                id,
                client,
                server: shared.server_addr,
                idle_timeout: shared.idle_timeout,
                linger: shared.linger,
                fault,
                spawner: Arc::new(Respawner {
                    shared: shared.clone(),
                    client,
                }),
            };
            match session.run(request).await {
                Ok(end) => info!(session = id, ?end, "session finished"),
                Err(e) => warn!(session = id, "session failed: {e}"),
            }
            shared.active.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// Turns a duplicated request into an extra, fault-free session for the
/// same client
struct Respawner {
    shared: Arc<RelayShared>,
    client: SocketAddr,
}

impl RequestSpawner for Respawner {
    fn spawn_session(&self, request: Vec<u8>) {
        info!(client = %self.client, "starting session for duplicated request");
        self.shared.start_session(self.client, request, None);
    }
}

/// Tracks whether the forwarded traffic has reached a terminal exchange
#[derive(Debug, Default)]
struct Completion {
    final_block: Option<u16>,
    final_acked: bool,
    errored: bool,
}

impl Completion {
    fn observe(&mut self, datagram: &[u8]) {
        match Message::decode(datagram) {
            Ok(Message::Error { .. }) => self.errored = true,
            Ok(Message::Data { block, payload }) if payload.len() < BLOCK_SIZE => {
                self.final_block = Some(block);
            }
            Ok(Message::Ack { block }) if Some(block) == self.final_block => {
                self.final_acked = true;
            }
            _ => {}
        }
    }
}

struct Session {
    id: u64,
    client: SocketAddr,
    server: SocketAddr,
    idle_timeout: Duration,
    linger: Duration,
    fault: Option<FaultSpec>,
    spawner: Arc<dyn RequestSpawner>,
}

impl Session {
    fn chain(&self, base: Arc<UdpStream>, counter: &PacketCounter) -> SharedStream {
        let base: SharedStream = base;
        let decorated = match &self.fault {
            Some(spec) => spec.wrap(base, Some(self.spawner.clone())),
            None => base,
        };
        Arc::new(Sequenced::new(decorated, counter.clone()))
    }

    async fn run(self, request: Vec<u8>) -> FaultResult<SessionEnd> {
        let counter = PacketCounter::new();
        let client_leg = Arc::new(UdpStream::new(
            Arc::new(AsyncUdpTransport::bind_ephemeral_for(self.client).await?),
            Some(self.client),
            counter.clone(),
        ));
        let server_leg = Arc::new(UdpStream::new(
            Arc::new(AsyncUdpTransport::bind_ephemeral_for(self.server).await?),
            Some(self.server),
            counter.clone(),
        ));
        let to_client = self.chain(client_leg.clone(), &counter);
        let to_server = self.chain(server_leg.clone(), &counter);

        info!(
            session = self.id,
            client = %self.client,
            fault = ?self.fault.as_ref().map(ToString::to_string),
            "session started"
        );

        let result = self.forward(request, &client_leg, &server_leg, &to_client, &to_server).await;

        for leg in [&client_leg, &server_leg] {
            if let Err(e) = leg.close().await {
                debug!(session = self.id, "leg close failed: {e}");
            }
        }
        result
    }

    async fn forward(
        &self,
        request: Vec<u8>,
        client_leg: &UdpStream,
        server_leg: &UdpStream,
        to_client: &SharedStream,
        to_server: &SharedStream,
    ) -> FaultResult<SessionEnd> {
        let mut completion = Completion::default();
        let mut server_tid: Option<SocketAddr> = None;

        to_server.send(request).await?;
        // only forwarded traffic moves the deadline; strays do not
        let mut deadline = Instant::now() + self.idle_timeout;

        loop {
            tokio::select! {
                received = client_leg.receive() => {
                    let (datagram, from) = received?;
                    if from != self.client {
                        debug!(session = self.id, %from, "ignoring datagram from unexpected client origin");
                        continue;
                    }
                    completion.observe(&datagram);
                    debug!(session = self.id, packet = to_server.sent_count() + 1, "client -> server");
                    to_server.send(datagram).await?;
                }
                received = server_leg.receive() => {
                    let (datagram, from) = received?;
                    match server_tid {
                        None => {
                            server_tid = Some(from);
                            server_leg.set_peer(from);
                            debug!(session = self.id, tid = %from, "server transfer ID learned");
                        }
                        Some(tid) if tid != from => {
                            debug!(session = self.id, %from, "ignoring datagram from unexpected server origin");
                            continue;
                        }
                        Some(_) => {}
                    }
                    completion.observe(&datagram);
                    debug!(session = self.id, packet = to_client.sent_count() + 1, "server -> client");
                    to_client.send(datagram).await?;
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Ok(if completion.final_acked {
                        SessionEnd::Completed
                    } else {
                        SessionEnd::Idle
                    });
                }
            }

            if completion.errored {
                return Ok(SessionEnd::Errored);
            }
            let quiet = if completion.final_acked {
                self.linger
            } else {
                self.idle_timeout
            };
            deadline = Instant::now() + quiet;
        }
    }
}
