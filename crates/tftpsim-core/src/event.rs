//! Transfer events and the sinks that receive them.
//!
//! A transfer reports everything observable about its progress as a
//! [`TransferEvent`] delivered synchronously, on the transfer's own task,
//! to one [`EventSink`]. Sinks are injected by whoever starts the
//! transfer; the library never logs through a global listener.

use crate::message::{ErrorCode, Message};
use crate::transfer::{Direction, TransferSummary};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Something that happened during a transfer
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// The transfer began
    Started {
        /// File being moved
        filename: String,
        /// Which way the bytes flow
        direction: Direction,
        /// Peer the first message goes to
        peer: Option<SocketAddr>,
    },
    /// A message was sent
    MessageSent {
        /// The message
        message: Message,
        /// Destination
        to: SocketAddr,
    },
    /// A message was accepted from the bound peer
    MessageReceived {
        /// The message
        message: Message,
        /// Origin
        from: Option<SocketAddr>,
    },
    /// The peer aborted with an `Error` message
    ErrorReceived {
        /// Error code
        code: ErrorCode,
        /// Peer's text
        text: String,
    },
    /// Free-form diagnostic
    Info(String),
    /// A receive attempt timed out
    Timeout {
        /// Attempts left before the peer is declared unreachable
        attempts_remaining: u32,
    },
    /// A datagram from a foreign origin was rejected
    UnknownTid {
        /// Bound TID
        expected: SocketAddr,
        /// Rejected origin
        actual: SocketAddr,
    },
    /// The transfer finished successfully
    Completed(TransferSummary),
    /// The transfer failed
    Failed {
        /// File being moved
        filename: String,
        /// Error description
        error: String,
    },
}

/// Receiver of transfer events
pub trait EventSink: Send + Sync {
    /// Handle one event. Called on the transfer task; must not block.
    fn emit(&self, event: &TransferEvent);
}

/// Shared, type-erased sink handle
pub type SharedSink = Arc<dyn EventSink>;

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &TransferEvent) {}
}

/// Sink that forwards events to a closure
pub struct FnSink<F>(pub F);

impl<F> EventSink for FnSink<F>
where
    F: Fn(&TransferEvent) + Send + Sync,
{
    fn emit(&self, event: &TransferEvent) {
        (self.0)(event);
    }
}

/// Wrap a closure as a [`SharedSink`]
pub fn sink_fn<F>(f: F) -> SharedSink
where
    F: Fn(&TransferEvent) + Send + Sync + 'static,
{
    Arc::new(FnSink(f))
}

impl EventSink for mpsc::UnboundedSender<TransferEvent> {
    fn emit(&self, event: &TransferEvent) {
        // receiver gone means nobody is listening any more
        let _ = self.send(event.clone());
    }
}

/// Sink that turns events into `tracing` records
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    label: String,
}

impl TracingSink {
    /// Create a sink whose records carry `label` (e.g. "client", "server")
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    /// Shared handle
    pub fn shared(label: impl Into<String>) -> SharedSink {
        Arc::new(Self::new(label))
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: &TransferEvent) {
        let label = self.label.as_str();
        match event {
            TransferEvent::Started {
                filename,
                direction,
                peer,
            } => {
                info!(%label, file = %filename, ?direction, ?peer, "transfer started");
            }
            TransferEvent::MessageSent { message, to } => {
                trace!(%label, peer = %to, "sent {message}");
            }
            TransferEvent::MessageReceived { message, from } => {
                trace!(%label, peer = ?from, "received {message}");
            }
            TransferEvent::ErrorReceived { code, text } => {
                warn!(%label, %code, "peer reported error: {text}");
            }
            TransferEvent::Info(text) => debug!(%label, "{text}"),
            TransferEvent::Timeout { attempts_remaining } => {
                debug!(%label, attempts_remaining, "receive timed out");
            }
            TransferEvent::UnknownTid { expected, actual } => {
                warn!(%label, %expected, %actual, "rejected datagram from unknown transfer ID");
            }
            TransferEvent::Completed(summary) => {
                info!(
                    %label,
                    file = %summary.filename,
                    bytes = summary.bytes,
                    blocks = summary.blocks,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "transfer complete"
                );
            }
            TransferEvent::Failed { filename, error } => {
                warn!(%label, file = %filename, "transfer failed: {error}");
            }
        }
    }
}

/// Sink that delivers every event to several sinks in order
pub struct Fanout(Vec<SharedSink>);

impl Fanout {
    /// Combine sinks
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self(sinks)
    }
}

impl EventSink for Fanout {
    fn emit(&self, event: &TransferEvent) {
        for sink in &self.0 {
            sink.emit(event);
        }
    }
}
