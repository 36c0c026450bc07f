//! Wire-level primitives for the MQTT v3.1.1 framing format.
//!
//! Everything here operates on plain byte slices: a cursor for consuming
//! fields from a received buffer, and helpers for the variable-length
//! remaining-length integer used in fixed headers.

use bytes::{BufMut, BytesMut};

use crate::protocol::DecodeError;


/// Maximum remaining length (128^4 - 1, the 4-byte encoding ceiling)
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// Default maximum packet size accepted by the server (1 MB)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Cursor over a received byte buffer.
///
/// Consumes fields from the front without copying. Every operation that
/// would read past the end of the slice fails with [`DecodeError::Truncated`]
/// instead of returning a short or empty result.
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn remaining_len(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consume exactly `n` bytes.
    pub fn pop_fixed(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining_len() < n {
            return Err(DecodeError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn pop_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.pop_fixed(1)?[0])
    }

    /// Consume a Two Byte Integer (big-endian).
    pub fn pop_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.pop_fixed(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Consume a length-prefixed field: a 2-byte big-endian length followed
    /// by that many bytes. MQTT uses this encoding for both "UTF-8 string"
    /// and binary fields.
    pub fn pop_length_prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.pop_u16()? as usize;
        self.pop_fixed(len)
    }

    /// Consume a length-prefixed UTF-8 string.
    pub fn pop_string(&mut self) -> Result<&'a str, DecodeError> {
        let raw = self.pop_length_prefixed()?;
        std::str::from_utf8(raw).map_err(|_| DecodeError::Malformed("invalid UTF-8 string"))
    }

    /// Decode a Variable Byte Integer (the remaining-length algorithm).
    ///
    /// At most 4 bytes are consumed; a 5th continuation byte is a protocol
    /// violation.
    pub fn pop_var_int(&mut self) -> Result<u32, DecodeError> {
        let mut multiplier: u32 = 1;
        let mut value: u32 = 0;
        let mut consumed = 0;

        loop {
            if consumed >= 4 {
                return Err(DecodeError::Malformed("remaining length exceeds 4 bytes"));
            }

            let byte = self.pop_u8()?;
            value += ((byte & 0x7F) as u32) * multiplier;
            consumed += 1;

            if (byte & 0x80) == 0 {
                break;
            }

            multiplier *= 128;
        }

        Ok(value)
    }
}

/// Write a Variable Byte Integer.
#[inline]
pub fn write_var_int(buf: &mut BytesMut, mut value: u32) {
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Write a length-prefixed string field.
#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}
