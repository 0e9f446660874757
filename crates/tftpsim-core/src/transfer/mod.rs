//! Transfer state machines.
//!
//! A transfer moves one file across one [`ReliableSocket`]. The
//! receiving side is [`ReadTransfer`] (a client's read, or a server
//! accepting a write) and the sending side is [`WriteTransfer`] (a
//! client's write, or a server answering a read).

pub mod read;
pub mod storage;
pub mod write;

pub use read::ReadTransfer;
pub use storage::{BoxedSource, Destination, FileDestination, MemoryDestination, SharedBuffer};
pub use write::WriteTransfer;

use crate::error::{Error, Result};
use crate::event::{SharedSink, TransferEvent};
use crate::message::{ErrorCode, Message};
use crate::socket::ReliableSocket;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tftpsim_transport::Transport;
use tracing::debug;

/// Transfer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Created, nothing sent yet
    Init,
    /// Blocks are moving
    Transferring,
    /// Last block acknowledged; waiting out a possible retransmission
    AwaitingFinalAck,
    /// Finished successfully
    Complete,
    /// Aborted
    Errored,
}

impl TransferStatus {
    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Errored)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Transferring => "transferring",
            Self::AwaitingFinalAck => "awaiting final ack",
            Self::Complete => "complete",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Which way file bytes flow, seen from the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local file goes to the peer
    Send,
    /// Peer's file lands locally
    Receive,
}

/// Outcome of a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    /// File name as named in the request
    pub filename: String,
    /// Which way the bytes flowed
    pub direction: Direction,
    /// Peer TID, once known
    pub peer: Option<SocketAddr>,
    /// Payload bytes moved
    pub bytes: u64,
    /// Data blocks moved, including an empty final block
    pub blocks: u64,
    /// Final status
    pub status: TransferStatus,
    /// Wall-clock duration
    pub elapsed: Duration,
}

/// State shared by both machines: socket, sink and counters
pub(crate) struct Context<T: Transport> {
    pub(crate) socket: ReliableSocket<T>,
    pub(crate) sink: SharedSink,
    pub(crate) filename: String,
    pub(crate) direction: Direction,
    pub(crate) status: TransferStatus,
    pub(crate) bytes: u64,
    pub(crate) blocks: u64,
    started: Instant,
}

impl<T: Transport> Context<T> {
    pub(crate) fn new(
        socket: ReliableSocket<T>,
        sink: SharedSink,
        filename: String,
        direction: Direction,
    ) -> Self {
        Self {
            socket,
            sink,
            filename,
            direction,
            status: TransferStatus::Init,
            bytes: 0,
            blocks: 0,
            started: Instant::now(),
        }
    }

    pub(crate) fn start(&mut self) {
        self.started = Instant::now();
        self.sink.emit(&TransferEvent::Started {
            filename: self.filename.clone(),
            direction: self.direction,
            peer: self.socket.peer().or(self.socket.remote()),
        });
    }

    pub(crate) fn info(&self, text: String) {
        self.sink.emit(&TransferEvent::Info(text));
    }

    /// Send to the current peer and report it
    pub(crate) async fn send(&self, message: &Message) -> Result<()> {
        let to = self.socket.send(message, None).await?;
        self.sink.emit(&TransferEvent::MessageSent {
            message: message.clone(),
            to,
        });
        Ok(())
    }

    /// Receive the next message, re-sending `resend` on timeout if given.
    ///
    /// An undecodable datagram from the peer aborts the transfer, so the
    /// peer is told `IllegalOperation` before the error propagates.
    pub(crate) async fn receive(&mut self, resend: Option<&Message>) -> Result<Message> {
        let received = match resend {
            Some(message) => self.socket.receive_or_resend(message).await,
            None => self.socket.receive().await,
        };

        match received {
            Ok(message) => {
                self.sink.emit(&TransferEvent::MessageReceived {
                    message: message.clone(),
                    from: self.socket.peer(),
                });
                if let Message::Error { code, text } = &message {
                    self.sink.emit(&TransferEvent::ErrorReceived {
                        code: *code,
                        text: text.clone(),
                    });
                }
                Ok(message)
            }
            Err(Error::InvalidMessage(e)) => {
                let text = e.to_string();
                Err(self.fail(Error::InvalidMessage(e), &text).await)
            }
            Err(e) => Err(e),
        }
    }

    /// Tell the peer the transfer is over. Best effort.
    pub(crate) async fn abort(&self, code: ErrorCode, text: &str) {
        let message = Message::error(code, text);
        if let Err(e) = self.send(&message).await {
            debug!(file = %self.filename, "could not deliver {message}: {e}");
        }
    }

    /// Tell the peer why `error` ends the transfer, then hand it back
    pub(crate) async fn fail(&self, error: Error, text: &str) -> Error {
        self.abort(error.wire_code(), text).await;
        error
    }

    /// Abort with an order violation for `expected`
    pub(crate) async fn order_violation(&self, expected: u16, received: &Message) -> Error {
        let text = format!("expected block {expected}, got {received}");
        let error = Error::OrderViolation {
            expected,
            received: received.to_string(),
        };
        self.fail(error, &text).await
    }

    pub(crate) fn summary(&self) -> TransferSummary {
        TransferSummary {
            filename: self.filename.clone(),
            direction: self.direction,
            peer: self.socket.peer(),
            bytes: self.bytes,
            blocks: self.blocks,
            status: self.status,
            elapsed: self.started.elapsed(),
        }
    }

    /// Record the outcome, close the socket and report it
    pub(crate) async fn conclude(mut self, result: Result<()>) -> Result<TransferSummary> {
        let summary_peer = self.socket.peer();
        if let Err(e) = self.socket.close().await {
            debug!(file = %self.filename, "socket close failed: {e}");
        }

        match result {
            Ok(()) => {
                self.status = TransferStatus::Complete;
                let mut summary = self.summary();
                summary.peer = summary_peer;
                self.sink.emit(&TransferEvent::Completed(summary.clone()));
                Ok(summary)
            }
            Err(error) => {
                self.status = TransferStatus::Errored;
                self.sink.emit(&TransferEvent::Failed {
                    filename: self.filename.clone(),
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }
}
