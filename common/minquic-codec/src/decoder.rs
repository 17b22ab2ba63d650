// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use byteorder::{BigEndian, ByteOrder};
use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderError {
    UnexpectedEof,
    InvariantViolation(&'static str),
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecoderError::UnexpectedEof => write!(f, "unexpected end of buffer"),
            DecoderError::InvariantViolation(reason) => write!(f, "{reason}"),
        }
    }
}

pub type DecoderBufferResult<'a, T> = Result<(T, DecoderBuffer<'a>), DecoderError>;

/// `DecoderBuffer` is a panic-free byte buffer for look-ahead decoding
/// untrusted input. Every decode operation returns the decoded value along
/// with the remaining buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderBuffer<'a> {
    bytes: &'a [u8],
}

impl<'a> DecoderBuffer<'a> {
    #[inline]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Move out the buffer's slice. This should be used with caution, as it
    /// removes any panic protection this struct provides.
    #[inline]
    pub fn into_less_safe_slice(self) -> &'a [u8] {
        self.bytes
    }

    #[inline]
    pub fn ensure_len(&self, len: usize) -> Result<(), DecoderError> {
        if self.bytes.len() < len {
            Err(DecoderError::UnexpectedEof)
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn ensure_empty(&self) -> Result<(), DecoderError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(DecoderError::InvariantViolation("unexpected trailing bytes"))
        }
    }

    #[inline]
    pub fn peek_byte(&self, index: usize) -> Result<u8, DecoderError> {
        self.bytes.get(index).copied().ok_or(DecoderError::UnexpectedEof)
    }

    #[inline]
    pub fn skip(self, len: usize) -> Result<DecoderBuffer<'a>, DecoderError> {
        self.ensure_len(len)?;
        Ok(Self::new(&self.bytes[len..]))
    }

    #[inline]
    pub fn decode_slice(self, len: usize) -> DecoderBufferResult<'a, &'a [u8]> {
        self.ensure_len(len)?;
        let (slice, remaining) = self.bytes.split_at(len);
        Ok((slice, Self::new(remaining)))
    }

    #[inline]
    pub fn decode_u8(self) -> DecoderBufferResult<'a, u8> {
        let (slice, remaining) = self.decode_slice(1)?;
        Ok((slice[0], remaining))
    }

    #[inline]
    pub fn decode_u16(self) -> DecoderBufferResult<'a, u16> {
        let (slice, remaining) = self.decode_slice(2)?;
        Ok((BigEndian::read_u16(slice), remaining))
    }

    #[inline]
    pub fn decode_u32(self) -> DecoderBufferResult<'a, u32> {
        let (slice, remaining) = self.decode_slice(4)?;
        Ok((BigEndian::read_u32(slice), remaining))
    }

    #[inline]
    pub fn decode_u64(self) -> DecoderBufferResult<'a, u64> {
        let (slice, remaining) = self.decode_slice(8)?;
        Ok((BigEndian::read_u64(slice), remaining))
    }

    /// Decodes a big-endian unsigned integer of `len` bytes, `len <= 8`
    #[inline]
    pub fn decode_uint(self, len: usize) -> DecoderBufferResult<'a, u64> {
        if len > 8 {
            return Err(DecoderError::InvariantViolation("integer wider than 8 bytes"));
        }
        let (slice, remaining) = self.decode_slice(len)?;
        let mut value = 0u64;
        for byte in slice {
            value = (value << 8) | u64::from(*byte);
        }
        Ok((value, remaining))
    }
}

impl<'a> From<&'a [u8]> for DecoderBuffer<'a> {
    #[inline]
    fn from(bytes: &'a [u8]) -> Self {
        Self::new(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_integers() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let buffer = DecoderBuffer::new(&bytes);

        let (value, _) = buffer.decode_u8().unwrap();
        assert_eq!(value, 0x01);
        let (value, _) = buffer.decode_u16().unwrap();
        assert_eq!(value, 0x0102);
        let (value, _) = buffer.decode_u32().unwrap();
        assert_eq!(value, 0x0102_0304);
        let (value, remaining) = buffer.decode_u64().unwrap();
        assert_eq!(value, 0x0102_0304_0506_0708);
        assert!(remaining.is_empty());
    }

    #[test]
    fn decode_uint_variable_width() {
        let bytes = [0xab, 0xcd, 0xef];
        let buffer = DecoderBuffer::new(&bytes);

        let (value, _) = buffer.decode_uint(0).unwrap();
        assert_eq!(value, 0);
        let (value, _) = buffer.decode_uint(2).unwrap();
        assert_eq!(value, 0xabcd);
        let (value, remaining) = buffer.decode_uint(3).unwrap();
        assert_eq!(value, 0x00ab_cdef);
        assert!(remaining.is_empty());
        assert!(buffer.decode_uint(4).is_err());
        assert!(buffer.decode_uint(9).is_err());
    }

    #[test]
    fn eof_is_reported() {
        let bytes = [0x01];
        let buffer = DecoderBuffer::new(&bytes);

        assert_eq!(buffer.decode_u16().unwrap_err(), DecoderError::UnexpectedEof);
        assert_eq!(buffer.peek_byte(1).unwrap_err(), DecoderError::UnexpectedEof);
        assert!(buffer.skip(2).is_err());
        assert!(buffer.ensure_empty().is_err());
        assert!(buffer.skip(1).unwrap().ensure_empty().is_ok());
    }
}
