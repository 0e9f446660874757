//! # tftpsim Core
//!
//! Trivial file transfer over UDP: the wire codec, a reliable
//! request/response socket, the block-sequenced transfer state machines,
//! and the client and server built on them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────────┐
//! │           Client             │             Server               │
//! │  (one task per command)      │  (accept worker + task/request)  │
//! ├──────────────────────────────┴──────────────────────────────────┤
//! │               ReadTransfer / WriteTransfer                       │
//! │        (block sequencing, ack matching, termination)             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      ReliableSocket                              │
//! │          (timeouts, retry budget, TID validation)                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Message                                  │
//! │              (RRQ / WRQ / DATA / ACK / ERROR)                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod event;
pub mod message;
pub mod server;
pub mod socket;
pub mod transfer;

pub use client::{Client, ClientConfig};
pub use error::{Error, MessageError, Result};
pub use event::{EventSink, Fanout, NullSink, SharedSink, TracingSink, TransferEvent, sink_fn};
pub use message::{ErrorCode, Message, Mode, Opcode, RequestKind};
pub use server::{Server, ServerConfig, ShutdownReport};
pub use socket::{DEFAULT_ATTEMPTS, DEFAULT_TIMEOUT, ReliableSocket, SocketConfig};
pub use transfer::{
    Direction, ReadTransfer, TransferStatus, TransferSummary, WriteTransfer,
};

/// Payload bytes in a full data block
pub const BLOCK_SIZE: usize = 512;

/// Well-known server port
pub const DEFAULT_SERVER_PORT: u16 = 69;

/// Well-known relay port
pub const DEFAULT_RELAY_PORT: u16 = 68;

/// Attempt budget while lingering after the final block
pub const FINAL_ACK_ATTEMPTS: u32 = 2;
