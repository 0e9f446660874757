//! Field-level packet mutation.
//!
//! Mutations work on raw bytes, not on decoded messages, so they can
//! produce datagrams the codec would never emit (unknown opcodes,
//! oversized payloads, truncated headers).

use crate::fault::FaultResult;
use crate::stream::{DatagramStream, SharedStream, Trigger};
use async_trait::async_trait;
use std::net::SocketAddr;
use tftpsim_core::Opcode;
use tracing::info;

/// Overrides applied to one datagram. Unset fields pass through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketModifier {
    /// Replacement for the two opcode bytes
    pub opcode: Option<u16>,
    /// Replacement block number (`Data`/`Ack` only)
    pub block: Option<u16>,
    /// Replacement filename (requests only)
    pub filename: Option<Vec<u8>>,
    /// Replacement mode string (requests only)
    pub mode: Option<Vec<u8>>,
    /// Replacement payload (`Data` only)
    pub payload: Option<Vec<u8>>,
    /// Final length: truncate or zero-pad to exactly this many bytes
    pub length: Option<usize>,
}

impl PacketModifier {
    /// Modifier that only rewrites the opcode
    pub fn opcode(opcode: u16) -> Self {
        Self {
            opcode: Some(opcode),
            ..Self::default()
        }
    }

    /// Set the block number override
    #[must_use]
    pub fn with_block(mut self, block: u16) -> Self {
        self.block = Some(block);
        self
    }

    /// Set the filename override
    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<Vec<u8>>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Set the mode override
    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<Vec<u8>>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    /// Set the payload override
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Set the final length
    #[must_use]
    pub fn with_length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }

    /// Whether every field passes through
    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the overrides to `datagram`.
    ///
    /// Field overrides are chosen by the datagram's original opcode; the
    /// opcode override and the length are applied last.
    pub fn apply(&self, datagram: &[u8]) -> Vec<u8> {
        let original = datagram.get(1).copied().and_then(|b| Opcode::try_from(b).ok());
        let mut out = match original {
            Some(Opcode::Read | Opcode::Write) => self.rewrite_request(datagram),
            Some(Opcode::Data | Opcode::Ack) => self.rewrite_block(datagram, original == Some(Opcode::Data)),
            _ => datagram.to_vec(),
        };

        if let Some(opcode) = self.opcode {
            if out.len() < 2 {
                out.resize(2, 0);
            }
            out[..2].copy_from_slice(&opcode.to_be_bytes());
        }
        if let Some(length) = self.length {
            out.resize(length, 0);
        }
        out
    }

    fn rewrite_request(&self, datagram: &[u8]) -> Vec<u8> {
        if self.filename.is_none() && self.mode.is_none() {
            return datagram.to_vec();
        }

        let body = &datagram[2..];
        let Some(name_end) = body.iter().position(|&b| b == 0) else {
            return datagram.to_vec();
        };
        let rest = &body[name_end + 1..];
        let Some(mode_end) = rest.iter().position(|&b| b == 0) else {
            return datagram.to_vec();
        };

        let filename = self.filename.as_deref().unwrap_or(&body[..name_end]);
        let mode = self.mode.as_deref().unwrap_or(&rest[..mode_end]);

        let mut out = Vec::with_capacity(datagram.len() + filename.len() + mode.len());
        out.extend_from_slice(&datagram[..2]);
        out.extend_from_slice(filename);
        out.push(0);
        out.extend_from_slice(mode);
        out.push(0);
        out.extend_from_slice(&rest[mode_end + 1..]);
        out
    }

    fn rewrite_block(&self, datagram: &[u8], is_data: bool) -> Vec<u8> {
        let mut out = datagram.to_vec();
        if let Some(block) = self.block {
            if out.len() < 4 {
                out.resize(4, 0);
            }
            out[2..4].copy_from_slice(&block.to_be_bytes());
        }
        if is_data {
            if let Some(payload) = &self.payload {
                out.truncate(4);
                out.resize(4, 0);
                out.extend_from_slice(payload);
            }
        }
        out
    }
}

/// Rewrites one datagram with a [`PacketModifier`]
pub struct ModifyFault {
    inner: SharedStream,
    trigger: Trigger,
    modifier: PacketModifier,
}

impl ModifyFault {
    /// Rewrite datagram number `packet`
    pub fn new(inner: SharedStream, packet: u64, modifier: PacketModifier) -> Self {
        Self {
            inner,
            trigger: Trigger::new(packet),
            modifier,
        }
    }
}

#[async_trait]
impl DatagramStream for ModifyFault {
    async fn send(&self, datagram: Vec<u8>) -> FaultResult<()> {
        if !self.trigger.fires(self.inner.sent_count()) {
            return self.inner.send(datagram).await;
        }

        let modified = self.modifier.apply(&datagram);
        info!(
            packet = self.trigger.packet(),
            before = datagram.len(),
            after = modified.len(),
            "modifying datagram"
        );
        self.inner.send(modified).await
    }

    async fn receive(&self) -> FaultResult<(Vec<u8>, SocketAddr)> {
        self.inner.receive().await
    }

    fn sent_count(&self) -> u64 {
        self.inner.sent_count()
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer()
    }

    async fn close(&self) -> FaultResult<()> {
        self.inner.close().await
    }
}
