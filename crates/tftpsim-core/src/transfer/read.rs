//! Receiving state machine.
//!
//! ```text
//! Init ──request/grant──▶ Transferring ──short block──▶ AwaitingFinalAck ──▶ Complete
//!   └──────────────────────────┴──────────────────────────────┴──────────▶ Errored
//! ```

use super::storage::Destination;
use super::{Context, Direction, TransferStatus, TransferSummary};
use crate::error::{Error, Result};
use crate::event::SharedSink;
use crate::message::{ErrorCode, Message, Mode};
use crate::socket::ReliableSocket;
use crate::{BLOCK_SIZE, FINAL_ACK_ATTEMPTS};
use tftpsim_transport::{AsyncUdpTransport, Transport};
use tracing::{debug, warn};

/// How the exchange opens
#[derive(Debug, Clone, Copy)]
enum Opening {
    /// Client: send a read request, then wait for block 1
    Request(Mode),
    /// Server: a write request was accepted; grant it with `Ack(0)`
    Grant,
}

/// Pulls a file into local storage block by block
pub struct ReadTransfer<T: Transport = AsyncUdpTransport> {
    ctx: Context<T>,
    output: Box<dyn Destination>,
    opening: Opening,
}

impl<T: Transport> ReadTransfer<T> {
    /// Client-side read of `filename` from the socket's remote
    pub fn request(
        socket: ReliableSocket<T>,
        filename: impl Into<String>,
        mode: Mode,
        output: Box<dyn Destination>,
        sink: SharedSink,
    ) -> Self {
        Self {
            ctx: Context::new(socket, sink, filename.into(), Direction::Receive),
            output,
            opening: Opening::Request(mode),
        }
    }

    /// Server-side receive of an accepted write request. `socket` must be
    /// bound to the requester.
    pub fn granted(
        socket: ReliableSocket<T>,
        filename: impl Into<String>,
        output: Box<dyn Destination>,
        sink: SharedSink,
    ) -> Self {
        Self {
            ctx: Context::new(socket, sink, filename.into(), Direction::Receive),
            output,
            opening: Opening::Grant,
        }
    }

    /// Run to completion.
    ///
    /// On failure the partial output is discarded and the error returned;
    /// either way the outcome is also reported to the sink.
    pub async fn run(mut self) -> Result<TransferSummary> {
        self.ctx.start();
        let result = self.exchange().await;

        if result.is_err() {
            if let Err(e) = self.output.discard().await {
                warn!(file = %self.ctx.filename, "failed to discard partial output: {e}");
            }
        }

        self.ctx.conclude(result).await
    }

    async fn exchange(&mut self) -> Result<()> {
        let (mut last_ack, mut resend) = match self.opening {
            Opening::Request(mode) => {
                let request = Message::read(self.ctx.filename.clone(), mode);
                self.ctx.send(&request).await?;
                self.ctx.socket.reset();
                (None, Some(request))
            }
            Opening::Grant => {
                let grant = Message::ack(0);
                self.ctx.send(&grant).await?;
                (Some(0u16), Some(grant))
            }
        };
        self.ctx.status = TransferStatus::Transferring;

        let mut expected: u16 = 1;
        let mut violations = 0u32;

        loop {
            let message = self.ctx.receive(resend.as_ref()).await?;

            match message {
                Message::Error { code, text } => return Err(Error::PeerError { code, text }),
                Message::Data { block, payload } if block == expected => {
                    let last = payload.len() < BLOCK_SIZE;
                    self.store(&payload, last).await?;
                    self.ctx.bytes += payload.len() as u64;
                    self.ctx.blocks += 1;

                    let ack = Message::ack(block);
                    self.ctx.send(&ack).await?;
                    last_ack = Some(block);
                    expected = block.wrapping_add(1);
                    violations = 0;
                    resend = None;

                    if last {
                        self.dally(ack).await;
                        return Ok(());
                    }
                }
                other => {
                    let Some(previous) = last_ack else {
                        return Err(self.ctx.order_violation(expected, &other).await);
                    };

                    violations += 1;
                    if violations >= self.ctx.socket.attempts() {
                        return Err(self.ctx.order_violation(expected, &other).await);
                    }

                    self.ctx.info(format!(
                        "expected block {expected}, got {other}; re-sending ACK #{previous}"
                    ));
                    self.ctx.send(&Message::ack(previous)).await?;
                }
            }
        }
    }

    /// Persist one block; the final one is flushed before it is acked.
    /// Any failure is reported to the peer as `DiskFull`.
    async fn store(&mut self, payload: &[u8], last: bool) -> Result<()> {
        let stored = match self.output.write_block(payload).await {
            Ok(()) if last => self
                .output
                .finish()
                .await
                .map_err(|source| ("flushing output", source)),
            Ok(()) => Ok(()),
            Err(source) => Err(("writing received block", source)),
        };

        match stored {
            Ok(()) => Ok(()),
            Err((context, source)) => {
                self.ctx
                    .abort(ErrorCode::DiskFull, ErrorCode::DiskFull.default_message())
                    .await;
                Err(Error::LocalIo { context, source })
            }
        }
    }

    /// Linger after the final ack in case it was lost and the sender
    /// retransmits the last block. The output is already complete, so
    /// nothing here can fail the transfer.
    async fn dally(&mut self, ack: Message) {
        self.ctx.status = TransferStatus::AwaitingFinalAck;
        self.ctx.socket.set_attempts(FINAL_ACK_ATTEMPTS);

        match self.ctx.receive(None).await {
            Ok(Message::Data { block, .. }) if Some(block) == ack.block() => {
                self.ctx
                    .info(format!("final block {block} repeated; re-sending ACK"));
                if let Err(e) = self.ctx.send(&ack).await {
                    debug!(file = %self.ctx.filename, "could not re-send final ACK: {e}");
                }
            }
            Ok(other) => self.ctx.info(format!("ignoring {other} after final block")),
            Err(Error::Unreachable { .. }) => {}
            Err(e) => debug!(file = %self.ctx.filename, "after final block: {e}"),
        }
    }
}
