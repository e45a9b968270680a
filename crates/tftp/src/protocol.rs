//! TFTP Packet Codec
//!
//! This module contains the wire format of the five RFC 1350 packet kinds
//! together with the opcode and error code tables.
//!
//! # Wire Format
//!
//! Every packet starts with a big-endian 16-bit opcode. Since all opcodes fit
//! in one byte, the first byte on the wire is always zero:
//!
//! ```text
//! RRQ/WRQ | 0 | op | filename | 0 | mode | 0 |
//! DATA    | 0 | 3  | block (u16) | payload (0-512 bytes) |
//! ACK     | 0 | 4  | block (u16) |
//! ERROR   | 0 | 5  | code (u16)  | message | 0 |
//! ```
//!
//! Decoding is tolerant where real-world clients are sloppy (missing string
//! terminators, oversized data payloads) and strict where the framing itself
//! is broken.

use std::fmt;

use thiserror::Error;

/// Size of a full DATA payload. A shorter payload ends the transfer.
pub const BLOCK_SIZE: usize = 512;

/// Largest datagram read from a socket.
///
/// Larger than any valid TFTP packet so that oversized DATA payloads reach the
/// decoder intact instead of being silently truncated by the kernel.
pub const MAX_DATAGRAM: usize = 1500;

/// TFTP Protocol Opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Client requests to read a file from the server.
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Client requests to write a file to the server.
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Carries up to [`BLOCK_SIZE`] bytes of file content. A payload shorter
    /// than [`BLOCK_SIZE`] marks the last block of a transfer.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Acknowledges a data block. ACK 0 accepts a write request.
    ///
    /// Packet format: | Opcode | Block# |
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Reports an error condition and terminates the current transfer.
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,
}

impl Opcode {
    /// Convert the second byte of a packet to an Opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::Opcode;
    ///
    /// assert_eq!(Opcode::from_u8(1), Some(Opcode::ReadRequest));
    /// assert_eq!(Opcode::from_u8(6), None);
    /// ```
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 wire representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::Opcode;
    ///
    /// assert_eq!(Opcode::WriteRequest.name(), "WRQ");
    /// assert_eq!(Opcode::Acknowledgment.name(), "ACK");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Error Codes
///
/// Standard error codes as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Error code 0: Not defined, see error message
    NotDefined = 0,
    /// Error code 1: File not found
    FileNotFound = 1,
    /// Error code 2: Access violation
    AccessViolation = 2,
    /// Error code 3: Disk full or allocation exceeded
    DiskFull = 3,
    /// Error code 4: Illegal TFTP operation
    IllegalOperation = 4,
    /// Error code 5: Unknown transfer ID
    ///
    /// This server also uses it to report failed transfers ("Send failed",
    /// "Data not expected"), which is what existing clients observe.
    UnknownTransferId = 5,
    /// Error code 6: File already exists
    FileAlreadyExists = 6,
    /// Error code 7: No such user
    NoSuchUser = 7,
}

impl ErrorCode {
    /// Convert a u16 value to an ErrorCode
    ///
    /// # Examples
    /// ```
    /// use tftp::ErrorCode;
    ///
    /// assert_eq!(ErrorCode::from_u16(1), Some(ErrorCode::FileNotFound));
    /// assert_eq!(ErrorCode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    /// Convert the error code to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this error code
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// Reasons a datagram cannot be decoded, or a packet cannot be encoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),
    #[error("first byte must be zero, got {0:#04x}")]
    BadMagic(u8),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("{0} packet truncated")]
    Truncated(Opcode),
    /// The server never originates requests, so they have no encoder.
    #[error("encoding {0} packets is not supported")]
    NotSupported(Opcode),
}

/// A decoded TFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest { filename: String, mode: String },
    WriteRequest { filename: String, mode: String },
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: u16, message: String },
}

impl Packet {
    /// Create a DATA packet
    pub fn data(block: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self::Data {
            block,
            payload: payload.into(),
        }
    }

    /// Create an ACK packet
    pub fn ack(block: u16) -> Self {
        Self::Ack { block }
    }

    /// Create an ERROR packet with a custom message
    ///
    /// # Examples
    /// ```
    /// use tftp::{ErrorCode, Packet};
    ///
    /// let packet = Packet::error(ErrorCode::FileNotFound, "File not found");
    /// assert_eq!(packet.encode().unwrap(), b"\0\x05\0\x01File not found\0");
    /// ```
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.as_u16(),
            message: message.into(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Self::ReadRequest { .. } => Opcode::ReadRequest,
            Self::WriteRequest { .. } => Opcode::WriteRequest,
            Self::Data { .. } => Opcode::Data,
            Self::Ack { .. } => Opcode::Acknowledgment,
            Self::Error { .. } => Opcode::Error,
        }
    }

    /// Decode a datagram into a packet
    ///
    /// DATA payloads are passed through whatever their length; deciding
    /// whether a block is the last one is up to the transfer.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < 2 {
            return Err(PacketError::TooShort(buf.len()));
        }
        if buf[0] != 0 {
            return Err(PacketError::BadMagic(buf[0]));
        }
        let opcode = Opcode::from_u8(buf[1]).ok_or(PacketError::UnknownOpcode(buf[1]))?;
        let body = &buf[2..];

        match opcode {
            Opcode::ReadRequest | Opcode::WriteRequest => {
                let (filename, rest) = read_text(body);
                let (mode, _) = read_text(rest);
                if opcode == Opcode::ReadRequest {
                    Ok(Self::ReadRequest { filename, mode })
                } else {
                    Ok(Self::WriteRequest { filename, mode })
                }
            }
            Opcode::Data => {
                let block = read_u16(body, opcode)?;
                Ok(Self::Data {
                    block,
                    payload: body[2..].to_vec(),
                })
            }
            Opcode::Acknowledgment => Ok(Self::Ack {
                block: read_u16(body, opcode)?,
            }),
            Opcode::Error => {
                let code = read_u16(body, opcode)?;
                let (message, _) = read_text(&body[2..]);
                Ok(Self::Error { code, message })
            }
        }
    }

    /// Encode the packet for the wire
    ///
    /// Fails with [`PacketError::NotSupported`] for RRQ and WRQ: only clients
    /// send requests, so asking the server to encode one is a bug.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let opcode = self.opcode();
        match self {
            Self::ReadRequest { .. } | Self::WriteRequest { .. } => Err(PacketError::NotSupported(opcode)),
            Self::Data { block, payload } => {
                let mut v = Vec::with_capacity(4 + payload.len());
                v.extend_from_slice(&opcode.as_u16().to_be_bytes());
                v.extend_from_slice(&block.to_be_bytes());
                v.extend_from_slice(payload);
                Ok(v)
            }
            Self::Ack { block } => {
                let mut v = Vec::with_capacity(4);
                v.extend_from_slice(&opcode.as_u16().to_be_bytes());
                v.extend_from_slice(&block.to_be_bytes());
                Ok(v)
            }
            Self::Error { code, message } => {
                let mut v = Vec::with_capacity(4 + message.len() + 1);
                v.extend_from_slice(&opcode.as_u16().to_be_bytes());
                v.extend_from_slice(&code.to_be_bytes());
                v.extend_from_slice(message.as_bytes());
                v.push(0);
                Ok(v)
            }
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadRequest { filename, mode } | Self::WriteRequest { filename, mode } => {
                write!(f, "{} {:?} ({})", self.opcode(), filename, mode)
            }
            Self::Data { block, payload } => write!(f, "DATA #{} ({} bytes)", block, payload.len()),
            Self::Ack { block } => write!(f, "ACK #{}", block),
            Self::Error { code, message } => write!(f, "ERROR {}: {}", code, message),
        }
    }
}

/// Find the next null byte in a buffer starting from a given position
pub fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf[start..].iter().position(|&b| b == 0).map(|pos| start + pos)
}

/// Split a NUL-terminated string off the front of `buf`.
///
/// A missing terminator takes the rest of the buffer.
fn read_text(buf: &[u8]) -> (String, &[u8]) {
    match find_zero(buf, 0) {
        Some(end) => (String::from_utf8_lossy(&buf[..end]).into_owned(), &buf[end + 1..]),
        None => (String::from_utf8_lossy(buf).into_owned(), &[]),
    }
}

fn read_u16(buf: &[u8], opcode: Opcode) -> Result<u16, PacketError> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(PacketError::Truncated(opcode)),
    }
}
