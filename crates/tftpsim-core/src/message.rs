//! Message encoding and decoding for the tftpsim wire protocol.
//!
//! Every datagram is one message. Byte 0 is always `0x00` and byte 1 is
//! the opcode; all multi-byte integers are big-endian (network byte
//! order). Strings are 7-bit ASCII terminated by a single NUL.
//!
//! ```text
//! Request  | 00 | 01/02 | filename | 00 | mode | 00 |
//! Data     | 00 | 03    | block (2)      | payload (0..=512) |
//! Ack      | 00 | 04    | block (2)      |
//! Error    | 00 | 05    | code (2)       | text | 00 |
//! ```

use crate::BLOCK_SIZE;
use crate::error::MessageError;
use std::fmt;
use std::io;
use std::str::FromStr;

/// Message opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Read request
    Read = 1,
    /// Write request
    Write = 2,
    /// File data block
    Data = 3,
    /// Block acknowledgment
    Ack = 4,
    /// Transfer error
    Error = 5,
}

impl TryFrom<u8> for Opcode {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, MessageError> {
        match value {
            1 => Ok(Self::Read),
            2 => Ok(Self::Write),
            3 => Ok(Self::Data),
            4 => Ok(Self::Ack),
            5 => Ok(Self::Error),
            _ => Err(MessageError::UnknownOpcode(value)),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "RRQ",
            Self::Write => "WRQ",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Direction requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Client pulls a file from the server
    Read,
    /// Client pushes a file to the server
    Write,
}

impl RequestKind {
    /// Opcode carrying this request
    pub fn opcode(self) -> Opcode {
        match self {
            Self::Read => Opcode::Read,
            Self::Write => Opcode::Write,
        }
    }
}

/// Transfer mode named in a request.
///
/// Both modes move bytes unchanged; the mode is carried so peers that
/// care about line endings can act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// `netascii`
    NetAscii,
    /// `octet`
    #[default]
    Octet,
}

impl Mode {
    /// Lowercase wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetAscii => "netascii",
            Self::Octet => "octet",
        }
    }
}

impl FromStr for Mode {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("netascii") {
            Ok(Self::NetAscii)
        } else if s.eq_ignore_ascii_case("octet") {
            Ok(Self::Octet)
        } else {
            Err(MessageError::InvalidMode(s.to_string()))
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried by `Error` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Not defined, see error message
    NotDefined = 0,
    /// File not found
    FileNotFound = 1,
    /// Access violation
    AccessViolation = 2,
    /// Disk full or allocation exceeded
    DiskFull = 3,
    /// Illegal operation
    IllegalOperation = 4,
    /// Unknown transfer ID
    UnknownTid = 5,
    /// File already exists
    FileAlreadyExists = 6,
    /// No such user
    NoSuchUser = 7,
}

impl ErrorCode {
    /// Canonical text for this code
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Not defined",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal operation",
            Self::UnknownTid => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }

    /// Map a local I/O failure onto the closest wire code
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::FileNotFound,
            io::ErrorKind::PermissionDenied => Self::AccessViolation,
            io::ErrorKind::AlreadyExists => Self::FileAlreadyExists,
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => Self::DiskFull,
            _ => Self::NotDefined,
        }
    }
}

impl From<u16> for ErrorCode {
    /// Unrecognised codes decode as `IllegalOperation`.
    fn from(value: u16) -> Self {
        match value {
            0 => Self::NotDefined,
            1 => Self::FileNotFound,
            2 => Self::AccessViolation,
            3 => Self::DiskFull,
            4 => Self::IllegalOperation,
            5 => Self::UnknownTid,
            6 => Self::FileAlreadyExists,
            7 => Self::NoSuchUser,
            _ => Self::IllegalOperation,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", *self as u16, self.default_message())
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Read or write request
    Request {
        /// Read or write
        kind: RequestKind,
        /// Requested file name
        filename: String,
        /// Transfer mode
        mode: Mode,
    },
    /// File data block
    Data {
        /// Block number, 1 for the first block
        block: u16,
        /// Up to [`BLOCK_SIZE`] bytes; shorter means last block
        payload: Vec<u8>,
    },
    /// Acknowledgment of a data block (0 grants a write)
    Ack {
        /// Acknowledged block number
        block: u16,
    },
    /// Transfer error; terminates the transfer
    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable text
        text: String,
    },
}

impl Message {
    /// Read request
    pub fn read(filename: impl Into<String>, mode: Mode) -> Self {
        Self::Request {
            kind: RequestKind::Read,
            filename: filename.into(),
            mode,
        }
    }

    /// Write request
    pub fn write(filename: impl Into<String>, mode: Mode) -> Self {
        Self::Request {
            kind: RequestKind::Write,
            filename: filename.into(),
            mode,
        }
    }

    /// Data block
    pub fn data(block: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self::Data {
            block,
            payload: payload.into(),
        }
    }

    /// Acknowledgment
    pub fn ack(block: u16) -> Self {
        Self::Ack { block }
    }

    /// Error message
    pub fn error(code: ErrorCode, text: impl Into<String>) -> Self {
        Self::Error {
            code,
            text: text.into(),
        }
    }

    /// Opcode of this message
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Request { kind, .. } => kind.opcode(),
            Self::Data { .. } => Opcode::Data,
            Self::Ack { .. } => Opcode::Ack,
            Self::Error { .. } => Opcode::Error,
        }
    }

    /// Block number of a `Data` or `Ack`
    pub fn block(&self) -> Option<u16> {
        match self {
            Self::Data { block, .. } | Self::Ack { block } => Some(*block),
            _ => None,
        }
    }

    /// Whether this is a read or write request
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request { .. })
    }

    /// Whether this is a `Data` block shorter than [`BLOCK_SIZE`]
    pub fn is_final_data(&self) -> bool {
        matches!(self, Self::Data { payload, .. } if payload.len() < BLOCK_SIZE)
    }

    /// Size of the encoded message in bytes
    pub fn encoded_len(&self) -> usize {
        2 + match self {
            Self::Request { filename, mode, .. } => filename.len() + mode.as_str().len() + 2,
            Self::Data { payload, .. } => 2 + payload.len(),
            Self::Ack { .. } => 2,
            Self::Error { text, .. } => 2 + text.len() + 1,
        }
    }

    /// Encode into wire bytes.
    ///
    /// Strings are written as-is; callers that build messages from
    /// untrusted input should keep them ASCII so the peer can decode them.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(0);
        buf.push(self.opcode() as u8);

        match self {
            Self::Request { filename, mode, .. } => {
                buf.extend_from_slice(filename.as_bytes());
                buf.push(0);
                buf.extend_from_slice(mode.as_str().as_bytes());
                buf.push(0);
            }
            Self::Data { block, payload } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Self::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Self::Error { code, text } => {
                buf.extend_from_slice(&(*code as u16).to_be_bytes());
                buf.extend_from_slice(text.as_bytes());
                buf.push(0);
            }
        }

        buf
    }

    /// Decode wire bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`MessageError`] naming the first field that failed
    /// validation.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < 2 {
            return Err(MessageError::TooShort {
                field: "opcode",
                expected: 2,
                actual: bytes.len(),
            });
        }
        if bytes[0] != 0 {
            return Err(MessageError::NonZeroLeadByte(bytes[0]));
        }

        let opcode = Opcode::try_from(bytes[1])?;
        let body = &bytes[2..];

        match opcode {
            Opcode::Read | Opcode::Write => {
                let (filename, rest) = take_string(body, "filename")?;
                let (mode, rest) = take_string(rest, "mode")?;
                ensure_consumed(rest, "mode")?;
                let mode = mode.parse()?;
                let kind = if opcode == Opcode::Read {
                    RequestKind::Read
                } else {
                    RequestKind::Write
                };
                Ok(Self::Request {
                    kind,
                    filename,
                    mode,
                })
            }
            Opcode::Data => {
                let (block, payload) = take_u16(body, "block")?;
                if payload.len() > BLOCK_SIZE {
                    return Err(MessageError::PayloadTooLarge(payload.len()));
                }
                Ok(Self::Data {
                    block,
                    payload: payload.to_vec(),
                })
            }
            Opcode::Ack => {
                let (block, rest) = take_u16(body, "block")?;
                ensure_consumed(rest, "block")?;
                Ok(Self::Ack { block })
            }
            Opcode::Error => {
                let (code, rest) = take_u16(body, "error code")?;
                let (text, rest) = take_string(rest, "error text")?;
                ensure_consumed(rest, "error text")?;
                Ok(Self::Error {
                    code: ErrorCode::from(code),
                    text,
                })
            }
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request {
                kind,
                filename,
                mode,
            } => write!(f, "{} {filename:?} ({mode})", kind.opcode()),
            Self::Data { block, payload } => {
                write!(f, "DATA #{block} ({} bytes)", payload.len())
            }
            Self::Ack { block } => write!(f, "ACK #{block}"),
            Self::Error { code, text } => write!(f, "ERROR {code}: {text}"),
        }
    }
}

fn take_u16<'a>(bytes: &'a [u8], field: &'static str) -> Result<(u16, &'a [u8]), MessageError> {
    if bytes.len() < 2 {
        return Err(MessageError::TooShort {
            field,
            expected: 2,
            actual: bytes.len(),
        });
    }
    Ok((u16::from_be_bytes([bytes[0], bytes[1]]), &bytes[2..]))
}

fn take_string<'a>(
    bytes: &'a [u8],
    field: &'static str,
) -> Result<(String, &'a [u8]), MessageError> {
    let nul = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(MessageError::MissingTerminator { field })?;
    let raw = &bytes[..nul];
    if !raw.is_ascii() {
        return Err(MessageError::NonAscii { field });
    }
    let text = raw.iter().map(|&b| char::from(b)).collect();
    Ok((text, &bytes[nul + 1..]))
}

fn ensure_consumed(rest: &[u8], field: &'static str) -> Result<(), MessageError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(MessageError::TrailingBytes {
            field,
            count: rest.len(),
        })
    }
}
