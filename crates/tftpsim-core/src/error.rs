//! Error types for tftpsim transfers.

use crate::message::ErrorCode;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tftpsim_transport::TransportError;

/// Transfer errors.
///
/// Every variant is scoped to the transfer that produced it: a transfer
/// task returns it and reports it through its event sink, and nothing
/// else in the process is affected.
#[derive(Debug, Error)]
pub enum Error {
    /// A datagram could not be decoded
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] MessageError),

    /// The peer sent an `Error` message
    #[error("peer error {code}: {text}")]
    PeerError {
        /// Error code carried on the wire
        code: ErrorCode,
        /// Peer's explanation
        text: String,
    },

    /// A message arrived out of sequence and could not be recovered
    #[error("order violation: expected block {expected}, received {received}")]
    OrderViolation {
        /// Block number the transfer was waiting for
        expected: u16,
        /// Description of what arrived instead
        received: String,
    },

    /// The attempt budget ran out with no datagram from the peer
    #[error("peer unreachable after {attempts} attempts")]
    Unreachable {
        /// Attempts made
        attempts: u32,
    },

    /// A datagram arrived from an origin other than the bound TID
    #[error("datagram from unknown transfer ID {actual} (bound to {expected})")]
    UnknownTid {
        /// Bound TID
        expected: SocketAddr,
        /// Datagram origin
        actual: SocketAddr,
    },

    /// Local storage failed (disk full, unreadable source, ...)
    #[error("local I/O failure while {context}: {source}")]
    LocalIo {
        /// What the transfer was doing
        context: &'static str,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The datagram transport failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A send had no explicit address, no bound TID and no remote
    #[error("no peer to send to")]
    NotConnected,
}

impl Error {
    /// Wire error code best describing this failure to a peer
    #[must_use]
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::InvalidMessage(_) | Self::OrderViolation { .. } => ErrorCode::IllegalOperation,
            Self::UnknownTid { .. } => ErrorCode::UnknownTid,
            Self::LocalIo { source, .. } => ErrorCode::from_io(source),
            Self::PeerError { code, .. } => *code,
            Self::Unreachable { .. } | Self::Transport(_) | Self::NotConnected => {
                ErrorCode::NotDefined
            }
        }
    }
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Codec errors. Each names the field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Not enough bytes for a field
    #[error("message too short for {field}: need {expected} bytes, got {actual}")]
    TooShort {
        /// Field being read
        field: &'static str,
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Byte 0 must be zero
    #[error("opcode high byte must be 0x00, got 0x{0:02X}")]
    NonZeroLeadByte(u8),

    /// Opcode byte is not 1..=5
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),

    /// A string field has no NUL terminator
    #[error("{field} is not NUL-terminated")]
    MissingTerminator {
        /// Field being read
        field: &'static str,
    },

    /// A string field holds non-ASCII bytes
    #[error("{field} contains non-ASCII bytes")]
    NonAscii {
        /// Field being read
        field: &'static str,
    },

    /// Mode string is neither `netascii` nor `octet`
    #[error("unsupported transfer mode: {0:?}")]
    InvalidMode(String),

    /// Data payload longer than one block
    #[error("data payload of {0} bytes exceeds the 512-byte block size")]
    PayloadTooLarge(usize),

    /// Bytes left over after the last field
    #[error("{count} unexpected bytes after {field}")]
    TrailingBytes {
        /// Last field read
        field: &'static str,
        /// Leftover byte count
        count: usize,
    },
}

impl MessageError {
    /// Name of the offending field
    #[must_use]
    pub fn field(&self) -> &'static str {
        match self {
            Self::TooShort { field, .. }
            | Self::MissingTerminator { field }
            | Self::NonAscii { field }
            | Self::TrailingBytes { field, .. } => field,
            Self::NonZeroLeadByte(_) | Self::UnknownOpcode(_) => "opcode",
            Self::InvalidMode(_) => "mode",
            Self::PayloadTooLarge(_) => "payload",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_error_names_field() {
        assert_eq!(MessageError::NonZeroLeadByte(1).field(), "opcode");
        assert_eq!(MessageError::UnknownOpcode(9).field(), "opcode");
        assert_eq!(
            MessageError::MissingTerminator { field: "filename" }.field(),
            "filename"
        );
        assert_eq!(MessageError::InvalidMode("mail".into()).field(), "mode");
        assert_eq!(MessageError::PayloadTooLarge(600).field(), "payload");
    }

    #[test]
    fn test_error_display() {
        let err = Error::Unreachable { attempts: 5 };
        assert_eq!(err.to_string(), "peer unreachable after 5 attempts");

        let err = Error::PeerError {
            code: ErrorCode::FileNotFound,
            text: "no such file".into(),
        };
        assert!(err.to_string().contains("no such file"));

        let err = Error::from(MessageError::UnknownOpcode(7));
        assert_eq!(err.to_string(), "invalid message: unknown opcode: 7");
    }

    #[test]
    fn test_error_wire_codes() {
        let disk_full = Error::LocalIo {
            context: "writing output",
            source: io::Error::new(io::ErrorKind::StorageFull, "full"),
        };
        assert_eq!(disk_full.wire_code(), ErrorCode::DiskFull);
        assert_eq!(
            Error::OrderViolation {
                expected: 2,
                received: "ACK #1".into()
            }
            .wire_code(),
            ErrorCode::IllegalOperation
        );
    }
}
