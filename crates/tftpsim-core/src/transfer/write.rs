//! Sending state machine.

use super::storage::{BoxedSource, read_block};
use super::{Context, Direction, TransferStatus, TransferSummary};
use crate::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::event::SharedSink;
use crate::message::{Message, Mode};
use crate::socket::ReliableSocket;
use tftpsim_transport::{AsyncUdpTransport, Transport};

#[derive(Debug, Clone, Copy)]
enum Opening {
    /// Client: send a write request and wait for the `Ack(0)` grant
    Request(Mode),
    /// Server: answer an accepted read request starting at block 1
    Serve,
}

/// Pushes a local byte stream to the peer block by block
pub struct WriteTransfer<T: Transport = AsyncUdpTransport> {
    ctx: Context<T>,
    input: BoxedSource,
    opening: Opening,
}

impl<T: Transport> WriteTransfer<T> {
    /// Client-side write of `input` as `filename` on the socket's remote
    pub fn request(
        socket: ReliableSocket<T>,
        filename: impl Into<String>,
        mode: Mode,
        input: BoxedSource,
        sink: SharedSink,
    ) -> Self {
        Self {
            ctx: Context::new(socket, sink, filename.into(), Direction::Send),
            input,
            opening: Opening::Request(mode),
        }
    }

    /// Server-side answer to a read request. `socket` must be bound to
    /// the requester.
    pub fn serve(
        socket: ReliableSocket<T>,
        filename: impl Into<String>,
        input: BoxedSource,
        sink: SharedSink,
    ) -> Self {
        Self {
            ctx: Context::new(socket, sink, filename.into(), Direction::Send),
            input,
            opening: Opening::Serve,
        }
    }

    /// Run to completion
    pub async fn run(mut self) -> Result<TransferSummary> {
        self.ctx.start();
        let result = self.exchange().await;
        self.ctx.conclude(result).await
    }

    async fn exchange(&mut self) -> Result<()> {
        if let Opening::Request(mode) = self.opening {
            let request = Message::write(self.ctx.filename.clone(), mode);
            self.ctx.send(&request).await?;
            self.ctx.socket.reset();

            match self.ctx.receive(Some(&request)).await? {
                Message::Ack { block: 0 } => {}
                Message::Error { code, text } => return Err(Error::PeerError { code, text }),
                other => return Err(self.ctx.order_violation(0, &other).await),
            }
        }
        self.ctx.status = TransferStatus::Transferring;

        let mut block: u16 = 0;
        let mut buf = [0u8; BLOCK_SIZE];

        loop {
            let len = match read_block(&mut self.input, &mut buf).await {
                Ok(len) => len,
                Err(source) => {
                    let error = Error::LocalIo {
                        context: "reading source",
                        source,
                    };
                    return Err(self.ctx.fail(error, "failed to read source file").await);
                }
            };

            block = block.wrapping_add(1);
            let data = Message::data(block, buf[..len].to_vec());
            self.ctx.send(&data).await?;
            self.await_ack(&data, block).await?;

            self.ctx.bytes += len as u64;
            self.ctx.blocks += 1;

            if len < BLOCK_SIZE {
                return Ok(());
            }
        }
    }

    /// Wait for `Ack(block)`, re-sending `data` on every timeout
    async fn await_ack(&mut self, data: &Message, block: u16) -> Result<()> {
        let mut stale = 0u32;

        loop {
            match self.ctx.receive(Some(data)).await? {
                Message::Ack { block: acked } if acked == block => return Ok(()),
                Message::Ack { block: acked } => {
                    stale += 1;
                    if stale >= self.ctx.socket.attempts() {
                        return Err(self.ctx.order_violation(block, &Message::ack(acked)).await);
                    }
                    self.ctx
                        .info(format!("ignoring stale ACK #{acked} while waiting for #{block}"));
                }
                Message::Error { code, text } => return Err(Error::PeerError { code, text }),
                other => return Err(self.ctx.order_violation(block, &other).await),
            }
        }
    }
}
