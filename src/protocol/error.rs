//! Protocol error types

use std::fmt;

/// Errors raised while decoding a control packet.
///
/// Any of these is fatal for the connection that produced the bytes; the
/// dispatcher closes it rather than retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ended before a declared field did
    Truncated,
    /// Unknown command nibble in the fixed header
    InvalidPacketType(u8),
    /// Packet violates the v3.1.1 framing rules
    Malformed(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "buffer truncated mid-field"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::Malformed(msg) => write!(f, "malformed packet: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}
