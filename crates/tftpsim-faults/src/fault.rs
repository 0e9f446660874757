//! Fault selection.

use crate::delay::DelayFault;
use crate::drop::DropFault;
use crate::duplicate::{DuplicateFault, RequestSpawner};
use crate::modify::{ModifyFault, PacketModifier};
use crate::stream::SharedStream;
use crate::wrong_sender::{DEFAULT_REPLY_WAIT, WrongSenderFault};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tftpsim_transport::TransportError;
use thiserror::Error;

/// Fault pipeline errors
#[derive(Debug, Error)]
pub enum FaultError {
    /// Socket failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A stream has nowhere to send
    #[error("stream has no peer")]
    NoPeer,

    /// Packet numbers start at 1
    #[error("packet numbers start at 1, got {0}")]
    InvalidPacketNumber(u64),

    /// A fault description could not be parsed
    #[error("invalid fault {input:?}: {reason}")]
    Parse {
        /// Text that failed to parse
        input: String,
        /// What was wrong with it
        reason: String,
    },
}

/// Result type for fault operations
pub type FaultResult<T> = std::result::Result<T, FaultError>;

/// What happens to the chosen packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// Never delivered
    Drop,
    /// Delivered late
    Delay(Duration),
    /// Delivered twice, the copy after the given delay
    Duplicate(Duration),
    /// Delivered with fields rewritten
    Modify(PacketModifier),
    /// Delivered, plus a copy from a foreign transfer ID
    WrongSender,
}

/// One fault aimed at one packet number of a relay session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultSpec {
    /// 1-based packet number, counted across both directions
    pub packet: u64,
    /// What to do to it
    pub kind: FaultKind,
}

impl FaultSpec {
    /// Validated constructor
    pub fn new(packet: u64, kind: FaultKind) -> FaultResult<Self> {
        if packet == 0 {
            return Err(FaultError::InvalidPacketNumber(packet));
        }
        Ok(Self { packet, kind })
    }

    /// Replace the opcode of packet `packet`
    pub fn change_opcode(packet: u64, opcode: u16) -> FaultResult<Self> {
        Self::new(packet, FaultKind::Modify(PacketModifier::opcode(opcode)))
    }

    /// Wrap `inner` in the decorator for this fault.
    ///
    /// `spawner` receives duplicated requests; without one they are
    /// re-sent on `inner` like any other datagram.
    pub fn wrap(&self, inner: SharedStream, spawner: Option<Arc<dyn RequestSpawner>>) -> SharedStream {
        match &self.kind {
            FaultKind::Drop => Arc::new(DropFault::new(inner, self.packet)),
            FaultKind::Delay(delay) => Arc::new(DelayFault::new(inner, self.packet, *delay)),
            FaultKind::Duplicate(delay) => {
                let fault = DuplicateFault::new(inner, self.packet, *delay);
                match spawner {
                    Some(spawner) => Arc::new(fault.with_spawner(spawner)),
                    None => Arc::new(fault),
                }
            }
            FaultKind::Modify(modifier) => {
                Arc::new(ModifyFault::new(inner, self.packet, modifier.clone()))
            }
            FaultKind::WrongSender => Arc::new(
                WrongSenderFault::new(inner, self.packet).with_reply_wait(DEFAULT_REPLY_WAIT),
            ),
        }
    }
}

impl fmt::Display for FaultSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let packet = self.packet;
        match &self.kind {
            FaultKind::Drop => write!(f, "drop:{packet}"),
            FaultKind::Delay(d) => write!(f, "delay:{packet}:{}", d.as_millis()),
            FaultKind::Duplicate(d) => write!(f, "duplicate:{packet}:{}", d.as_millis()),
            FaultKind::Modify(m) => match m.opcode {
                Some(opcode) if *m == PacketModifier::opcode(opcode) => {
                    write!(f, "change-opcode:{packet}:{opcode}")
                }
                _ => write!(f, "modify:{packet}"),
            },
            FaultKind::WrongSender => write!(f, "wrong-sender:{packet}"),
        }
    }
}

impl FromStr for FaultSpec {
    type Err = FaultError;

    /// Parses `drop:N`, `delay:N:MS`, `duplicate:N:MS`,
    /// `change-opcode:N:OPCODE` and `wrong-sender:N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_err = |reason: &str| FaultError::Parse {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        let number = |field: Option<&str>, what: &str| -> FaultResult<u64> {
            field
                .ok_or_else(|| parse_err(&format!("missing {what}")))?
                .trim()
                .parse()
                .map_err(|_| parse_err(&format!("{what} must be a non-negative integer")))
        };

        let mut parts = s.split(':');
        let name = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let packet = number(parts.next(), "packet number")?;

        let kind = match name.as_str() {
            "drop" => FaultKind::Drop,
            "delay" => FaultKind::Delay(Duration::from_millis(number(parts.next(), "delay")?)),
            "duplicate" => {
                FaultKind::Duplicate(Duration::from_millis(number(parts.next(), "delay")?))
            }
            "change-opcode" | "opcode" => {
                let opcode = number(parts.next(), "opcode")?;
                let opcode = u16::try_from(opcode).map_err(|_| parse_err("opcode out of range"))?;
                FaultKind::Modify(PacketModifier::opcode(opcode))
            }
            "wrong-sender" => FaultKind::WrongSender,
            _ => return Err(parse_err("unknown fault kind")),
        };

        if parts.next().is_some() {
            return Err(parse_err("too many fields"));
        }
        Self::new(packet, kind)
    }
}
