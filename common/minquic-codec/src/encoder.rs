// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use byteorder::{BigEndian, ByteOrder};
use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderError {
    CapacityExceeded,
}

impl fmt::Display for EncoderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EncoderError::CapacityExceeded => write!(f, "encoder capacity exceeded"),
        }
    }
}

pub type EncoderResult = Result<(), EncoderError>;

/// Bounds-checked writer over a mutable byte slice.
///
/// Writing past the end of the slice returns `CapacityExceeded` instead of
/// panicking; packet assembly relies on this to detect that a frame does
/// not fit.
#[derive(Debug)]
pub struct EncoderBuffer<'a> {
    bytes: &'a mut [u8],
    position: usize,
}

impl<'a> EncoderBuffer<'a> {
    #[inline]
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Number of bytes written so far
    #[inline]
    pub fn len(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.position == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn remaining_capacity(&self) -> usize {
        self.bytes.len() - self.position
    }

    #[inline]
    fn checkpoint(&mut self, len: usize) -> Result<&mut [u8], EncoderError> {
        if self.remaining_capacity() < len {
            return Err(EncoderError::CapacityExceeded);
        }
        let start = self.position;
        self.position += len;
        Ok(&mut self.bytes[start..start + len])
    }

    #[inline]
    pub fn encode_u8(&mut self, value: u8) -> EncoderResult {
        self.checkpoint(1)?[0] = value;
        Ok(())
    }

    #[inline]
    pub fn encode_u16(&mut self, value: u16) -> EncoderResult {
        BigEndian::write_u16(self.checkpoint(2)?, value);
        Ok(())
    }

    #[inline]
    pub fn encode_u32(&mut self, value: u32) -> EncoderResult {
        BigEndian::write_u32(self.checkpoint(4)?, value);
        Ok(())
    }

    #[inline]
    pub fn encode_u64(&mut self, value: u64) -> EncoderResult {
        BigEndian::write_u64(self.checkpoint(8)?, value);
        Ok(())
    }

    /// Encodes the low `len` bytes of `value` big-endian, `len <= 8`
    #[inline]
    pub fn encode_uint(&mut self, value: u64, len: usize) -> EncoderResult {
        debug_assert!(len <= 8);
        if len > 8 {
            return Err(EncoderError::CapacityExceeded);
        }
        let slice = self.checkpoint(len)?;
        for (index, byte) in slice.iter_mut().enumerate() {
            let shift = (len - 1 - index) * 8;
            *byte = (value >> shift) as u8;
        }
        Ok(())
    }

    #[inline]
    pub fn encode_slice(&mut self, slice: &[u8]) -> EncoderResult {
        self.checkpoint(slice.len())?.copy_from_slice(slice);
        Ok(())
    }

    /// Backfills a u16 at an already-written position, e.g. a length prefix
    #[inline]
    pub fn encode_u16_at(&mut self, position: usize, value: u16) -> EncoderResult {
        if position + 2 > self.position {
            return Err(EncoderError::CapacityExceeded);
        }
        BigEndian::write_u16(&mut self.bytes[position..position + 2], value);
        Ok(())
    }

    /// Rewinds the write position, discarding bytes written after it
    #[inline]
    pub fn truncate(&mut self, position: usize) {
        debug_assert!(position <= self.position);
        self.position = position.min(self.position);
    }

    #[inline]
    pub fn as_written(&self) -> &[u8] {
        &self.bytes[..self.position]
    }

    #[inline]
    pub fn into_written(self) -> &'a mut [u8] {
        &mut self.bytes[..self.position]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_decoder() {
        use crate::DecoderBuffer;

        let mut storage = [0u8; 16];
        let mut encoder = EncoderBuffer::new(&mut storage);
        encoder.encode_u8(0x42).unwrap();
        encoder.encode_u16(0x1234).unwrap();
        encoder.encode_u32(0xdead_beef).unwrap();
        encoder.encode_uint(0x0a0b0c, 3).unwrap();
        assert_eq!(encoder.len(), 10);

        let buffer = DecoderBuffer::new(encoder.as_written());
        let (byte, buffer) = buffer.decode_u8().unwrap();
        assert_eq!(byte, 0x42);
        let (short, buffer) = buffer.decode_u16().unwrap();
        assert_eq!(short, 0x1234);
        let (word, buffer) = buffer.decode_u32().unwrap();
        assert_eq!(word, 0xdead_beef);
        let (uint, buffer) = buffer.decode_uint(3).unwrap();
        assert_eq!(uint, 0x0a0b0c);
        buffer.ensure_empty().unwrap();
    }

    #[test]
    fn capacity_is_enforced() {
        let mut storage = [0u8; 3];
        let mut encoder = EncoderBuffer::new(&mut storage);
        encoder.encode_u16(7).unwrap();
        assert_eq!(encoder.encode_u16(7), Err(EncoderError::CapacityExceeded));
        // the failed write must not consume capacity
        assert_eq!(encoder.remaining_capacity(), 1);
        encoder.encode_u8(9).unwrap();
        assert_eq!(encoder.as_written(), &[0, 7, 9]);
    }

    #[test]
    fn uint_widths_round_trip() {
        use crate::DecoderBuffer;
        use bolero::check;

        check!()
            .with_type::<(u64, u8)>()
            .cloned()
            .for_each(|(value, len)| {
                let len = usize::from(len % 9);
                let value = if len == 8 {
                    value
                } else {
                    value & ((1u64 << (len * 8)) - 1)
                };

                let mut storage = [0u8; 8];
                let mut encoder = EncoderBuffer::new(&mut storage);
                encoder.encode_uint(value, len).unwrap();
                assert_eq!(encoder.len(), len);

                let (decoded, remaining) = DecoderBuffer::new(encoder.as_written())
                    .decode_uint(len)
                    .unwrap();
                assert_eq!(decoded, value);
                assert!(remaining.is_empty());
            });
    }

    #[test]
    fn backfill_length_prefix() {
        let mut storage = [0u8; 8];
        let mut encoder = EncoderBuffer::new(&mut storage);
        let prefix = encoder.len();
        encoder.encode_u16(0).unwrap();
        encoder.encode_slice(b"abcd").unwrap();
        encoder.encode_u16_at(prefix, 4).unwrap();
        assert_eq!(encoder.as_written(), &[0, 4, b'a', b'b', b'c', b'd']);
    }
}
