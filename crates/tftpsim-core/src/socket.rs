//! Reliable request/response socket.
//!
//! [`ReliableSocket`] layers three things over an unreliable datagram
//! [`Transport`]:
//!
//! - a per-attempt receive timeout with a bounded attempt budget,
//! - optional retransmission of a message on each timeout,
//! - transaction-ID (TID) validation: the first peer heard from after
//!   [`ReliableSocket::reset`] is the only one whose datagrams are
//!   accepted until the next reset.
//!
//! A datagram from any other origin is answered with
//! `Error(UnknownTid)` and otherwise ignored. It neither rebinds the TID
//! nor consumes an attempt nor extends the current attempt's deadline.

use crate::error::{Error, Result};
use crate::event::{SharedSink, TransferEvent};
use crate::message::{ErrorCode, Message, Opcode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tftpsim_transport::{AsyncUdpTransport, MAX_DATAGRAM_SIZE, Transport};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

/// Default per-attempt receive timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2400);

/// Default attempt budget
pub const DEFAULT_ATTEMPTS: u32 = 5;

/// Retry policy for a [`ReliableSocket`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketConfig {
    /// How long one receive attempt waits
    pub timeout: Duration,
    /// Receive attempts before the peer is declared unreachable
    pub attempts: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
        }
    }
}

/// A datagram socket associated with at most one peer at a time
pub struct ReliableSocket<T: Transport = AsyncUdpTransport> {
    transport: Arc<T>,
    remote: Option<SocketAddr>,
    tid: Option<SocketAddr>,
    timeout: Duration,
    attempts: u32,
    sink: SharedSink,
    buf: Vec<u8>,
}

impl<T: Transport> ReliableSocket<T> {
    /// Wrap a transport
    pub fn new(transport: Arc<T>, config: SocketConfig, sink: SharedSink) -> Self {
        Self {
            transport,
            remote: None,
            tid: None,
            timeout: config.timeout,
            attempts: config.attempts.max(1),
            sink,
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }

    /// Set where unaddressed sends go while no TID is bound
    #[must_use]
    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Bind the TID up front (server-side transfer sockets)
    #[must_use]
    pub fn bound_to(mut self, peer: SocketAddr) -> Self {
        self.remote = Some(peer);
        self.tid = Some(peer);
        self
    }

    /// Bound TID, if any
    pub fn peer(&self) -> Option<SocketAddr> {
        self.tid
    }

    /// Configured remote for unaddressed sends
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Local address of the underlying transport
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    /// Current attempt budget
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Change the attempt budget (at least one attempt is always made)
    pub fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts.max(1);
    }

    /// Current per-attempt timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change the per-attempt timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Forget the bound TID; the next accepted datagram binds a new one
    pub fn reset(&mut self) {
        self.tid = None;
    }

    /// Close the transport and forget the TID
    pub async fn close(&mut self) -> Result<()> {
        self.tid = None;
        self.transport.close().await?;
        Ok(())
    }

    /// Send `message`.
    ///
    /// With `to` set this is a one-shot send that leaves the TID alone.
    /// Otherwise it goes to the bound TID, or to the configured remote
    /// when no TID is bound yet. Returns the destination used.
    pub async fn send(&self, message: &Message, to: Option<SocketAddr>) -> Result<SocketAddr> {
        let dest = to.or(self.tid).or(self.remote).ok_or(Error::NotConnected)?;
        self.transport.send_to(&message.encode(), dest).await?;
        Ok(dest)
    }

    /// Receive the next message from the peer.
    ///
    /// # Errors
    ///
    /// `Unreachable` once every attempt timed out, `InvalidMessage` if
    /// the peer's datagram does not decode, `Transport` on socket failure.
    pub async fn receive(&mut self) -> Result<Message> {
        self.receive_inner(None).await
    }

    /// Like [`receive`](Self::receive), re-sending `resend` after every
    /// timeout that leaves attempts to spare.
    pub async fn receive_or_resend(&mut self, resend: &Message) -> Result<Message> {
        self.receive_inner(Some(resend)).await
    }

    async fn receive_inner(&mut self, resend: Option<&Message>) -> Result<Message> {
        let mut remaining = self.attempts;

        loop {
            let deadline = Instant::now() + self.timeout;
            if let Some(message) = self.receive_until(deadline).await? {
                return Ok(message);
            }

            remaining -= 1;
            self.sink.emit(&TransferEvent::Timeout {
                attempts_remaining: remaining,
            });
            if remaining == 0 {
                return Err(Error::Unreachable {
                    attempts: self.attempts,
                });
            }

            if let Some(message) = resend {
                let dest = self.send(message, None).await?;
                debug!(peer = %dest, "timed out, re-sent {message}");
            }
        }
    }

    /// Wait until `deadline` for a datagram from the bound peer.
    /// `Ok(None)` means the attempt timed out.
    async fn receive_until(&mut self, deadline: Instant) -> Result<Option<Message>> {
        loop {
            let (len, from) = match timeout_at(deadline, self.transport.recv_from(&mut self.buf)).await {
                Ok(received) => received?,
                Err(_) => return Ok(None),
            };

            if let Err(Error::UnknownTid { expected, actual }) = self.check_origin(from) {
                let is_error = self.buf[..len].starts_with(&[0, Opcode::Error as u8]);
                self.reject_impostor(expected, actual, is_error).await;
                continue;
            }

            let message = match Message::decode(&self.buf[..len]) {
                Ok(message) => message,
                Err(e) if self.tid.is_none() && !self.may_bind(from) => {
                    debug!(peer = %from, "ignoring undecodable datagram from a stranger: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.tid = Some(from);
            return Ok(Some(message));
        }
    }

    /// Whether `from` could be the peer answering on a fresh TID: it
    /// must share the configured remote's host
    fn may_bind(&self, from: SocketAddr) -> bool {
        self.remote.is_some_and(|remote| remote.ip() == from.ip())
    }

    fn check_origin(&self, from: SocketAddr) -> Result<()> {
        match self.tid {
            Some(expected) if expected != from => Err(Error::UnknownTid {
                expected,
                actual: from,
            }),
            _ => Ok(()),
        }
    }

    /// Errors are never answered, so two confused endpoints cannot
    /// bounce rejections back and forth
    async fn reject_impostor(&self, expected: SocketAddr, actual: SocketAddr, is_error: bool) {
        self.sink.emit(&TransferEvent::UnknownTid { expected, actual });
        if is_error {
            return;
        }

        let reply = Message::error(ErrorCode::UnknownTid, ErrorCode::UnknownTid.default_message());
        if let Err(e) = self.transport.send_to(&reply.encode(), actual).await {
            warn!(peer = %actual, "failed to reject unknown transfer ID: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{NullSink, sink_fn};
    use std::sync::Mutex;

    fn fast() -> SocketConfig {
        SocketConfig {
            timeout: Duration::from_millis(40),
            attempts: 5,
        }
    }

    async fn endpoint() -> AsyncUdpTransport {
        AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap()
    }

    fn recording() -> (SharedSink, Arc<Mutex<Vec<TransferEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let events = events.clone();
            sink_fn(move |event| events.lock().unwrap().push(event.clone()))
        };
        (sink, events)
    }

    #[tokio::test]
    async fn test_send_without_peer_fails() {
        let socket = ReliableSocket::new(Arc::new(endpoint().await), fast(), Arc::new(NullSink));
        let result = socket.send(&Message::ack(1), None).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_first_datagram_binds_tid() {
        let peer = endpoint().await;
        let mut socket = ReliableSocket::new(Arc::new(endpoint().await), fast(), Arc::new(NullSink));
        let local = socket.local_addr().unwrap();

        peer.send_to(&Message::ack(1).encode(), local).await.unwrap();
        assert_eq!(socket.receive().await.unwrap(), Message::ack(1));
        assert_eq!(socket.peer(), Some(peer.local_addr().unwrap()));

        socket.reset();
        assert_eq!(socket.peer(), None);
    }

    #[tokio::test]
    async fn test_silence_exhausts_budget() {
        let (sink, events) = recording();
        let mut socket = ReliableSocket::new(Arc::new(endpoint().await), fast(), sink);

        let result = socket.receive().await;
        assert!(matches!(result, Err(Error::Unreachable { attempts: 5 })));

        let events = events.lock().unwrap();
        let remaining: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Timeout { attempts_remaining } => Some(*attempts_remaining),
                _ => None,
            })
            .collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);
    }

    #[tokio::test]
    async fn test_receive_or_resend_retransmits() {
        let peer = endpoint().await;
        let peer_addr = peer.local_addr().unwrap();
        let mut socket = ReliableSocket::new(
            Arc::new(endpoint().await),
            SocketConfig {
                timeout: Duration::from_millis(30),
                attempts: 3,
            },
            Arc::new(NullSink),
        )
        .with_remote(peer_addr);

        let request = Message::read("f", crate::message::Mode::Octet);
        socket.send(&request, None).await.unwrap();
        let result = socket.receive_or_resend(&request).await;
        assert!(matches!(result, Err(Error::Unreachable { attempts: 3 })));

        // original + one resend per non-final timeout
        let mut buf = [0u8; 64];
        for _ in 0..3 {
            let (len, _) = tokio::time::timeout(Duration::from_millis(100), peer.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(Message::decode(&buf[..len]).unwrap(), request);
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(50), peer.recv_from(&mut buf))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_impostor_rejected_without_consuming_attempt() {
        let peer = endpoint().await;
        let impostor = endpoint().await;
        let (sink, events) = recording();
        let mut socket = ReliableSocket::new(
            Arc::new(endpoint().await),
            SocketConfig {
                timeout: Duration::from_millis(300),
                attempts: 1,
            },
            sink,
        )
        .bound_to(peer.local_addr().unwrap());
        let local = socket.local_addr().unwrap();

        impostor.send_to(&Message::ack(7).encode(), local).await.unwrap();
        peer.send_to(&Message::ack(2).encode(), local).await.unwrap();

        // a single attempt is enough: the impostor cost nothing
        assert_eq!(socket.receive().await.unwrap(), Message::ack(2));
        assert_eq!(socket.peer(), Some(peer.local_addr().unwrap()));

        let mut buf = [0u8; 64];
        let (len, from) = impostor.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, local);
        assert!(matches!(
            Message::decode(&buf[..len]).unwrap(),
            Message::Error {
                code: ErrorCode::UnknownTid,
                ..
            }
        ));

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            TransferEvent::UnknownTid { actual, .. } if *actual == impostor.local_addr().unwrap()
        )));
        assert!(!events.iter().any(|e| matches!(e, TransferEvent::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_impostor_does_not_extend_deadline() {
        let peer = endpoint().await;
        let impostor = endpoint().await;
        let mut socket = ReliableSocket::new(
            Arc::new(endpoint().await),
            SocketConfig {
                timeout: Duration::from_millis(150),
                attempts: 1,
            },
            Arc::new(NullSink),
        )
        .bound_to(peer.local_addr().unwrap());
        let local = socket.local_addr().unwrap();

        let spammer = tokio::spawn(async move {
            for _ in 0..10 {
                impostor.send_to(&Message::ack(1).encode(), local).await.unwrap();
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
        });

        let started = std::time::Instant::now();
        let result = socket.receive().await;
        assert!(matches!(result, Err(Error::Unreachable { attempts: 1 })));
        assert!(started.elapsed() < Duration::from_millis(350));
        spammer.abort();
    }

    #[tokio::test]
    async fn test_impostor_error_not_answered() {
        let peer = endpoint().await;
        let impostor = endpoint().await;
        let (sink, events) = recording();
        let mut socket = ReliableSocket::new(
            Arc::new(endpoint().await),
            SocketConfig {
                timeout: Duration::from_millis(300),
                attempts: 1,
            },
            sink,
        )
        .bound_to(peer.local_addr().unwrap());
        let local = socket.local_addr().unwrap();

        let stray = Message::error(ErrorCode::UnknownTid, "Unknown transfer ID");
        impostor.send_to(&stray.encode(), local).await.unwrap();
        peer.send_to(&Message::ack(1).encode(), local).await.unwrap();
        assert_eq!(socket.receive().await.unwrap(), Message::ack(1));

        let mut buf = [0u8; 64];
        assert!(
            tokio::time::timeout(Duration::from_millis(100), impostor.recv_from(&mut buf))
                .await
                .is_err()
        );
        assert!(
            events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, TransferEvent::UnknownTid { .. }))
        );
    }

    #[tokio::test]
    async fn test_undecodable_from_stranger_ignored_while_unbound() {
        let stranger = endpoint().await;
        // the remote lives on another loopback host than the stranger
        let mut socket = ReliableSocket::new(Arc::new(endpoint().await), fast(), Arc::new(NullSink))
            .with_remote(SocketAddr::from(([127, 0, 0, 2], 69)));
        let local = socket.local_addr().unwrap();

        stranger.send_to(&[0, 9, 9], local).await.unwrap();
        let result = socket.receive().await;
        assert!(matches!(result, Err(Error::Unreachable { attempts: 5 })));
        assert_eq!(socket.peer(), None);
    }

    #[tokio::test]
    async fn test_undecodable_datagram_does_not_bind() {
        let peer = endpoint().await;
        let mut socket = ReliableSocket::new(Arc::new(endpoint().await), fast(), Arc::new(NullSink))
            .with_remote(peer.local_addr().unwrap());
        let local = socket.local_addr().unwrap();

        peer.send_to(&[0, 9, 9], local).await.unwrap();
        let result = socket.receive().await;
        assert!(matches!(result, Err(Error::InvalidMessage(_))));
        assert_eq!(socket.peer(), None);
    }

    #[tokio::test]
    async fn test_explicit_send_keeps_tid() {
        let peer = endpoint().await;
        let other = endpoint().await;
        let socket = ReliableSocket::new(Arc::new(endpoint().await), fast(), Arc::new(NullSink))
            .bound_to(peer.local_addr().unwrap());

        let dest = socket
            .send(&Message::ack(0), Some(other.local_addr().unwrap()))
            .await
            .unwrap();
        assert_eq!(dest, other.local_addr().unwrap());
        assert_eq!(socket.peer(), Some(peer.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn test_set_attempts_floor() {
        let mut socket = ReliableSocket::new(Arc::new(endpoint().await), fast(), Arc::new(NullSink));
        socket.set_attempts(0);
        assert_eq!(socket.attempts(), 1);
        socket.set_timeout(Duration::from_millis(5));
        assert_eq!(socket.timeout(), Duration::from_millis(5));
    }
}
