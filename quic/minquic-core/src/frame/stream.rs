// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::Tag;
use minquic_codec::{
    DecoderBuffer, DecoderBufferResult, EncoderBuffer, EncoderError, EncoderResult,
};

const STREAM_TAG: Tag = 0xc0;
const FIN_BIT: Tag = 0x20;
const LENGTH_BIT: Tag = 0x01;

/// Carries a contiguous run of stream bytes.
///
/// The tag octet is a bitfield: `0b11 F SS OO D`. `F` marks the end of the
/// stream, `SS` selects a 1-4 byte stream id, `OO` selects a 0/2/4/8 byte
/// offset (0 meaning the data starts the stream) and `D` selects an
/// explicit 16-bit data length. Without `D` the data runs to the end of
/// the packet, so such a frame must be the last one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stream<'a> {
    pub stream_id: u32,
    pub offset: u64,
    pub fin: bool,
    /// Carry a 16-bit length so that another frame may follow
    pub explicit_length: bool,
    pub data: &'a [u8],
}

fn stream_id_len(stream_id: u32) -> usize {
    match stream_id {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        0x1_0000..=0xff_ffff => 3,
        _ => 4,
    }
}

fn offset_len(offset: u64) -> usize {
    match offset {
        0 => 0,
        1..=0xffff => 2,
        0x1_0000..=0xffff_ffff => 4,
        _ => 8,
    }
}

impl<'a> Stream<'a> {
    #[inline]
    pub fn tag(&self) -> Tag {
        let ss = (stream_id_len(self.stream_id) - 1) as Tag;
        let oo = match offset_len(self.offset) {
            0 => 0,
            2 => 1,
            4 => 2,
            _ => 3,
        } as Tag;

        let mut tag = STREAM_TAG | (ss << 3) | (oo << 1);
        if self.fin {
            tag |= FIN_BIT;
        }
        if self.explicit_length {
            tag |= LENGTH_BIT;
        }
        tag
    }

    /// Bytes this frame occupies on the wire
    #[inline]
    pub fn encoding_size(&self) -> usize {
        1 + stream_id_len(self.stream_id)
            + offset_len(self.offset)
            + if self.explicit_length { 2 } else { 0 }
            + self.data.len()
    }

    pub fn encode(&self, buffer: &mut EncoderBuffer) -> EncoderResult {
        buffer.encode_u8(self.tag())?;
        buffer.encode_uint(self.stream_id.into(), stream_id_len(self.stream_id))?;
        if self.offset != 0 {
            buffer.encode_uint(self.offset, offset_len(self.offset))?;
        }
        if self.explicit_length {
            let length =
                u16::try_from(self.data.len()).map_err(|_| EncoderError::CapacityExceeded)?;
            buffer.encode_u16(length)?;
        }
        buffer.encode_slice(self.data)?;
        Ok(())
    }

    pub fn decode(tag: Tag, buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        debug_assert_eq!(tag & STREAM_TAG, STREAM_TAG);

        let fin = tag & FIN_BIT != 0;
        let explicit_length = tag & LENGTH_BIT != 0;
        let stream_id_len = ((tag >> 3) & 0x03) as usize + 1;
        let offset_len = [0usize, 2, 4, 8][((tag >> 1) & 0x03) as usize];

        let (stream_id, buffer) = buffer.decode_uint(stream_id_len)?;
        let (offset, buffer) = if offset_len > 0 {
            buffer.decode_uint(offset_len)?
        } else {
            (0, buffer)
        };
        let (data, buffer) = if explicit_length {
            let (length, buffer) = buffer.decode_u16()?;
            buffer.decode_slice(length.into())?
        } else {
            buffer.decode_slice(buffer.len())?
        };

        Ok((
            Self {
                stream_id: stream_id as u32,
                offset,
                fin,
                explicit_length,
                data,
            },
            buffer,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Stream) {
        let mut storage = [0u8; 256];
        let mut encoder = EncoderBuffer::new(&mut storage);
        frame.encode(&mut encoder).unwrap();
        assert_eq!(encoder.len(), frame.encoding_size());

        let buffer = DecoderBuffer::new(encoder.as_written());
        let (tag, buffer) = buffer.decode_u8().unwrap();
        let (decoded, remaining) = Stream::decode(tag, buffer).unwrap();
        assert_eq!(decoded, frame);
        remaining.ensure_empty().unwrap();
    }

    #[test]
    fn field_width_selection() {
        for stream_id in [0u32, 1, 0xff, 0x100, 0xffff, 0x1_0000, u32::MAX] {
            for offset in [0u64, 1, 0xffff, 0x1_0000, 0xffff_ffff, 1 << 62] {
                round_trip(Stream {
                    stream_id,
                    offset,
                    fin: false,
                    explicit_length: true,
                    data: b"some data",
                });
            }
        }
    }

    #[test]
    fn implicit_length_runs_to_packet_end() {
        let bytes = [0xc0u8, 0x01, b'a', b'b', b'c'];
        let buffer = DecoderBuffer::new(&bytes).skip(1).unwrap();
        let (frame, remaining) = Stream::decode(0xc0, buffer).unwrap();
        assert_eq!(frame.stream_id, 1);
        assert_eq!(frame.offset, 0);
        assert_eq!(frame.data, b"abc");
        assert!(remaining.is_empty());
    }

    #[test]
    fn fin_without_data_is_valid_past_offset_zero() {
        round_trip(Stream {
            stream_id: 2,
            offset: 1000,
            fin: true,
            explicit_length: true,
            data: b"",
        });
    }
}
