// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{float16, frame::Tag};
use alloc::vec::Vec;
use minquic_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderError, EncoderBuffer, EncoderResult,
};

const ACK_TAG: Tag = 0xa0;
const BLOCKS_BIT: Tag = 0x10;

/// Acknowledges received packet numbers.
///
/// The tag octet is a bitfield: `0b101 N LL MM`. `N` marks the presence of
/// additional ack blocks beyond the first, `LL` selects the width of the
/// largest-acknowledged field and `MM` the width of the block lengths,
/// both from {1, 2, 4, 8} bytes. The ack delay travels as a float16
/// microsecond interval. A timestamp section is part of the wire format
/// but this implementation always sends zero entries and ignores received
/// ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    /// Highest packet number being acknowledged
    pub largest: u64,
    /// Time the acknowledger held the largest packet before acking
    pub delay_micros: u64,
    /// Count of packets acknowledged contiguously below `largest`
    pub first_block: u64,
    /// Further ranges, newest to oldest
    pub blocks: Vec<AckBlock>,
}

/// A continuation range. `gap` is the count of missing packets between
/// this block and the previous one minus one (adjacent ranges coalesce, so
/// at least one packet is always missing); `length` is the count of
/// acknowledged packets in the block minus one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckBlock {
    pub gap: u8,
    pub length: u64,
}

fn width_code(value: u64) -> u8 {
    match value {
        0..=0xff => 0,
        0x100..=0xffff => 1,
        0x1_0000..=0xffff_ffff => 2,
        _ => 3,
    }
}

const fn code_width(code: u8) -> usize {
    1 << code
}

impl Ack {
    #[inline]
    pub fn tag(&self) -> Tag {
        let ll = width_code(self.largest);
        let mm = width_code(
            self.blocks
                .iter()
                .map(|block| block.length)
                .fold(self.first_block, u64::max),
        );
        let mut tag = ACK_TAG | (ll << 2) | mm;
        if !self.blocks.is_empty() {
            tag |= BLOCKS_BIT;
        }
        tag
    }

    /// Ranges `(start, end)` of acknowledged packet numbers, inclusive on
    /// both ends, newest to oldest
    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        let first = (self.largest - self.first_block, self.largest);
        let mut start = first.0;
        core::iter::once(first).chain(self.blocks.iter().map(move |block| {
            let end = start - u64::from(block.gap) - 2;
            start = end - block.length;
            (start, end)
        }))
    }

    pub fn encode(&self, buffer: &mut EncoderBuffer) -> EncoderResult {
        let tag = self.tag();
        let largest_len = code_width((tag >> 2) & 0x03);
        let block_len = code_width(tag & 0x03);

        buffer.encode_u8(tag)?;
        if !self.blocks.is_empty() {
            debug_assert!(self.blocks.len() <= usize::from(u8::MAX));
            buffer.encode_u8(self.blocks.len() as u8)?;
        }
        // no timestamps
        buffer.encode_u8(0)?;
        buffer.encode_uint(self.largest, largest_len)?;
        buffer.encode_u16(float16::encode(self.delay_micros))?;
        buffer.encode_uint(self.first_block, block_len)?;
        for block in &self.blocks {
            buffer.encode_u8(block.gap)?;
            buffer.encode_uint(block.length, block_len)?;
        }
        Ok(())
    }

    pub fn decode(tag: Tag, buffer: DecoderBuffer<'_>) -> DecoderBufferResult<'_, Self> {
        debug_assert_eq!(tag & ACK_TAG, ACK_TAG);

        let largest_len = code_width((tag >> 2) & 0x03);
        let block_len = code_width(tag & 0x03);

        let (num_blocks, buffer) = if tag & BLOCKS_BIT != 0 {
            buffer.decode_u8()?
        } else {
            (0, buffer)
        };
        let (num_ts, buffer) = buffer.decode_u8()?;
        let (largest, buffer) = buffer.decode_uint(largest_len)?;
        let (delay, buffer) = buffer.decode_u16()?;
        let (first_block, buffer) = buffer.decode_uint(block_len)?;

        let mut lowest = largest
            .checked_sub(first_block)
            .ok_or(DecoderError::InvariantViolation("ack range underflow"))?;

        let mut blocks = Vec::with_capacity(num_blocks.into());
        let mut buffer = buffer;
        for _ in 0..num_blocks {
            let (gap, rest) = buffer.decode_u8()?;
            let (length, rest) = rest.decode_uint(block_len)?;
            lowest = lowest
                .checked_sub(u64::from(gap) + 2)
                .and_then(|end| end.checked_sub(length))
                .ok_or(DecoderError::InvariantViolation("ack range underflow"))?;
            blocks.push(AckBlock { gap, length });
            buffer = rest;
        }

        // skip the timestamp section: 5 bytes for the first entry, 3 for
        // each additional one
        let buffer = if num_ts > 0 {
            buffer.skip(5 + (usize::from(num_ts) - 1) * 3)?
        } else {
            buffer
        };

        Ok((
            Self {
                largest,
                delay_micros: float16::decode(delay),
                first_block,
                blocks,
            },
            buffer,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Ack) -> Ack {
        let mut storage = [0u8; 256];
        let mut encoder = EncoderBuffer::new(&mut storage);
        frame.encode(&mut encoder).unwrap();

        let buffer = DecoderBuffer::new(encoder.as_written());
        let (tag, buffer) = buffer.decode_u8().unwrap();
        assert_eq!(tag, frame.tag());
        let (decoded, remaining) = Ack::decode(tag, buffer).unwrap();
        remaining.ensure_empty().unwrap();
        decoded
    }

    #[test]
    fn single_range() {
        let frame = Ack {
            largest: 42,
            delay_micros: 125,
            first_block: 2,
            blocks: Vec::new(),
        };
        let decoded = round_trip(frame.clone());
        assert_eq!(decoded, frame);
        assert_eq!(decoded.ranges().collect::<Vec<_>>(), vec![(40, 42)]);
    }

    #[test]
    fn multiple_ranges() {
        let frame = Ack {
            largest: 100,
            delay_micros: 10_000,
            first_block: 0,
            blocks: vec![AckBlock { gap: 0, length: 2 }, AckBlock { gap: 3, length: 0 }],
        };
        let decoded = round_trip(frame.clone());
        assert_eq!(decoded, frame);
        // 100; gap of one missing packet -> 96..=98; gap of four -> 91
        assert_eq!(
            decoded.ranges().collect::<Vec<_>>(),
            vec![(100, 100), (96, 98), (91, 91)]
        );
    }

    #[test]
    fn wide_fields() {
        let frame = Ack {
            largest: 0x1_2345_6789,
            delay_micros: float16::MAX_VALUE,
            first_block: 0x10_0000,
            blocks: vec![AckBlock {
                gap: 255,
                length: 0x1_0000,
            }],
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn delay_is_lossy_but_bounded() {
        let frame = Ack {
            largest: 1,
            delay_micros: 123_457,
            first_block: 0,
            blocks: Vec::new(),
        };
        let decoded = round_trip(frame);
        assert!(decoded.delay_micros <= 123_457);
        assert!(decoded.delay_micros > 123_457 - 128);
    }

    #[test]
    fn underflowing_ranges_are_rejected() {
        // first block larger than the largest acknowledged
        let bytes = [0x00u8, 0x05, 0x00, 0x00, 0x07];
        assert!(Ack::decode(0xa0, DecoderBuffer::new(&bytes)).is_err());
    }

    #[test]
    fn received_timestamps_are_skipped() {
        // num_ts = 2: 5 + 3 bytes of timestamp data after the ack blocks
        let bytes = [
            0x02u8, // num_ts
            0x09,   // largest
            0x00, 0x00, // delay
            0x01, // first block
            0xaa, 0xbb, 0xcc, 0xdd, 0xee, // first timestamp entry
            0x11, 0x22, 0x33, // second timestamp entry
        ];
        let (frame, remaining) = Ack::decode(0xa0, DecoderBuffer::new(&bytes)).unwrap();
        remaining.ensure_empty().unwrap();
        assert_eq!(frame.largest, 9);
        assert_eq!(frame.first_block, 1);
    }
}
