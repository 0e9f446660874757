//! # tftpsim Transport
//!
//! Network plumbing shared by the tftpsim client, server and relay.
//!
//! This crate provides:
//! - The [`transport::Transport`] datagram abstraction
//! - A Tokio UDP implementation with per-endpoint statistics
//! - A start/stop-controlled [`worker::Worker`] poll loop for accept loops

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod transport;
pub mod udp_async;
pub mod worker;

pub use transport::{MAX_DATAGRAM_SIZE, Transport, TransportError, TransportResult, TransportStats};
pub use udp_async::AsyncUdpTransport;
pub use worker::{Step, Worker, WorkerError};

/// Socket options applied when binding a UDP endpoint
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Receive buffer size
    pub recv_buffer_size: usize,
    /// Send buffer size
    pub send_buffer_size: usize,
    /// Set `SO_REUSEADDR` before binding (listening sockets only)
    pub reuse_address: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 256 * 1024,
            send_buffer_size: 256 * 1024,
            reuse_address: false,
        }
    }
}
