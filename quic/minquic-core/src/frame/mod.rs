// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Frame codec
//!
//! Frames with a fixed shape get their codec from `fixed_frame_codec!`;
//! STREAM and ACK carry their parameters in the tag octet and are coded by
//! hand. Every decoder reports the remaining buffer, and every frame knows
//! whether it is pure ACK (no retransmittable content).

use minquic_codec::{DecoderBuffer, DecoderBufferResult, DecoderError, EncoderBuffer, EncoderResult};

pub type Tag = u8;

pub(crate) const TAG_PADDING: Tag = 0x00;
pub(crate) const TAG_RST_STREAM: Tag = 0x01;
pub(crate) const TAG_CONNECTION_CLOSE: Tag = 0x02;
pub(crate) const TAG_MAX_DATA: Tag = 0x04;
pub(crate) const TAG_MAX_STREAM_DATA: Tag = 0x05;
pub(crate) const TAG_MAX_STREAM_ID: Tag = 0x06;
pub(crate) const TAG_PING: Tag = 0x07;
pub(crate) const TAG_BLOCKED: Tag = 0x08;
pub(crate) const TAG_STREAM_BLOCKED: Tag = 0x09;
pub(crate) const TAG_STREAM_ID_NEEDED: Tag = 0x0a;
pub(crate) const TAG_NEW_CONNECTION_ID: Tag = 0x0b;
pub(crate) const TAG_STOP_SENDING: Tag = 0x0c;

// This implements a codec for a frame whose fields are fixed-width
// big-endian integers that don't vary with the tag
macro_rules! fixed_frame_codec {
    ($name:ident, $tag:expr, [$($field:ident: $width:tt),* $(,)?]) => {
        impl $name {
            pub const TAG: crate::frame::Tag = $tag;

            pub fn encode(
                &self,
                buffer: &mut minquic_codec::EncoderBuffer,
            ) -> minquic_codec::EncoderResult {
                buffer.encode_u8(Self::TAG)?;
                $(fixed_frame_codec!(@encode $width, buffer, self.$field);)*
                Ok(())
            }

            pub fn decode(
                buffer: minquic_codec::DecoderBuffer<'_>,
            ) -> minquic_codec::DecoderBufferResult<'_, Self> {
                $(let ($field, buffer) = fixed_frame_codec!(@decode $width, buffer);)*
                Ok((Self { $($field),* }, buffer))
            }
        }
    };
    (@encode u16, $buffer:ident, $value:expr) => { $buffer.encode_u16($value)? };
    (@encode u32, $buffer:ident, $value:expr) => { $buffer.encode_u32($value)? };
    (@encode u64, $buffer:ident, $value:expr) => { $buffer.encode_u64($value)? };
    (@decode u16, $buffer:ident) => { $buffer.decode_u16()? };
    (@decode u32, $buffer:ident) => { $buffer.decode_u32()? };
    (@decode u64, $buffer:ident) => { $buffer.decode_u64()? };
}

pub mod ack;
pub mod blocked;
pub mod connection_close;
pub mod max_data;
pub mod max_stream_data;
pub mod max_stream_id;
pub mod new_connection_id;
pub mod padding;
pub mod ping;
pub mod reset_stream;
pub mod stop_sending;
pub mod stream;

pub use ack::Ack;
pub use blocked::{Blocked, StreamBlocked, StreamIdNeeded};
pub use connection_close::ConnectionClose;
pub use max_data::MaxData;
pub use max_stream_data::MaxStreamData;
pub use max_stream_id::MaxStreamId;
pub use new_connection_id::NewConnectionId;
pub use padding::Padding;
pub use ping::Ping;
pub use reset_stream::ResetStream;
pub use stop_sending::StopSending;
pub use stream::Stream;

#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Padding(Padding),
    ResetStream(ResetStream),
    ConnectionClose(ConnectionClose<'a>),
    MaxData(MaxData),
    MaxStreamData(MaxStreamData),
    MaxStreamId(MaxStreamId),
    Ping(Ping),
    Blocked(Blocked),
    StreamBlocked(StreamBlocked),
    StreamIdNeeded(StreamIdNeeded),
    NewConnectionId(NewConnectionId),
    StopSending(StopSending),
    Ack(Ack),
    Stream(Stream<'a>),
}

macro_rules! dispatch_fixed {
    ($buffer:ident, $ty:ident, $variant:ident) => {{
        let buffer = $buffer.skip(1)?;
        let (frame, buffer) = $ty::decode(buffer)?;
        Ok((Frame::$variant(frame), buffer))
    }};
}

impl<'a> Frame<'a> {
    pub fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Frame<'a>> {
        let tag = buffer.peek_byte(0)?;
        match tag {
            TAG_PADDING => {
                let (frame, buffer) = Padding::decode(buffer)?;
                Ok((Frame::Padding(frame), buffer))
            }
            TAG_RST_STREAM => dispatch_fixed!(buffer, ResetStream, ResetStream),
            TAG_CONNECTION_CLOSE => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = ConnectionClose::decode(buffer)?;
                Ok((Frame::ConnectionClose(frame), buffer))
            }
            TAG_MAX_DATA => dispatch_fixed!(buffer, MaxData, MaxData),
            TAG_MAX_STREAM_DATA => dispatch_fixed!(buffer, MaxStreamData, MaxStreamData),
            TAG_MAX_STREAM_ID => dispatch_fixed!(buffer, MaxStreamId, MaxStreamId),
            TAG_PING => dispatch_fixed!(buffer, Ping, Ping),
            TAG_BLOCKED => dispatch_fixed!(buffer, Blocked, Blocked),
            TAG_STREAM_BLOCKED => dispatch_fixed!(buffer, StreamBlocked, StreamBlocked),
            TAG_STREAM_ID_NEEDED => dispatch_fixed!(buffer, StreamIdNeeded, StreamIdNeeded),
            TAG_NEW_CONNECTION_ID => dispatch_fixed!(buffer, NewConnectionId, NewConnectionId),
            TAG_STOP_SENDING => dispatch_fixed!(buffer, StopSending, StopSending),
            0xa0..=0xbf => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = Ack::decode(tag, buffer)?;
                Ok((Frame::Ack(frame), buffer))
            }
            0xc0..=0xff => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = Stream::decode(tag, buffer)?;
                Ok((Frame::Stream(frame), buffer))
            }
            _ => Err(DecoderError::InvariantViolation("unknown frame type")),
        }
    }

    pub fn encode(&self, buffer: &mut EncoderBuffer) -> EncoderResult {
        match self {
            Frame::Padding(frame) => frame.encode(buffer),
            Frame::ResetStream(frame) => frame.encode(buffer),
            Frame::ConnectionClose(frame) => frame.encode(buffer),
            Frame::MaxData(frame) => frame.encode(buffer),
            Frame::MaxStreamData(frame) => frame.encode(buffer),
            Frame::MaxStreamId(frame) => frame.encode(buffer),
            Frame::Ping(frame) => frame.encode(buffer),
            Frame::Blocked(frame) => frame.encode(buffer),
            Frame::StreamBlocked(frame) => frame.encode(buffer),
            Frame::StreamIdNeeded(frame) => frame.encode(buffer),
            Frame::NewConnectionId(frame) => frame.encode(buffer),
            Frame::StopSending(frame) => frame.encode(buffer),
            Frame::Ack(frame) => frame.encode(buffer),
            Frame::Stream(frame) => frame.encode(buffer),
        }
    }

    /// True when losing this frame never requires a retransmission
    pub fn is_pure_ack(&self) -> bool {
        matches!(self, Frame::Padding(_) | Frame::Ack(_))
    }

    /// Tag octet identifying the frame kind on the wire
    pub fn tag(&self) -> Tag {
        match self {
            Frame::Padding(_) => TAG_PADDING,
            Frame::ResetStream(_) => TAG_RST_STREAM,
            Frame::ConnectionClose(_) => TAG_CONNECTION_CLOSE,
            Frame::MaxData(_) => TAG_MAX_DATA,
            Frame::MaxStreamData(_) => TAG_MAX_STREAM_DATA,
            Frame::MaxStreamId(_) => TAG_MAX_STREAM_ID,
            Frame::Ping(_) => TAG_PING,
            Frame::Blocked(_) => TAG_BLOCKED,
            Frame::StreamBlocked(_) => TAG_STREAM_BLOCKED,
            Frame::StreamIdNeeded(_) => TAG_STREAM_ID_NEEDED,
            Frame::NewConnectionId(_) => TAG_NEW_CONNECTION_ID,
            Frame::StopSending(_) => TAG_STOP_SENDING,
            Frame::Ack(frame) => frame.tag(),
            Frame::Stream(frame) => frame.tag(),
        }
    }
}

/// Walks over one frame without interpreting it, reporting the bytes it
/// occupies and whether it is pure ACK. Used when scanning a stored packet
/// for retransmittable content.
pub fn skip(buffer: DecoderBuffer) -> Result<(usize, bool), DecoderError> {
    let before = buffer.len();
    let (frame, remaining) = Frame::decode(buffer)?;
    Ok((before - remaining.len(), frame.is_pure_ack()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) {
        let mut storage = [0u8; 1536];
        let mut encoder = EncoderBuffer::new(&mut storage);
        frame.encode(&mut encoder).unwrap();

        let (decoded, remaining) = Frame::decode(DecoderBuffer::new(encoder.as_written())).unwrap();
        remaining.ensure_empty().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn codec_round_trips() {
        round_trip(Frame::Padding(Padding { length: 17 }));
        round_trip(Frame::Ping(Ping {}));
        round_trip(Frame::Blocked(Blocked {}));
        round_trip(Frame::StreamIdNeeded(StreamIdNeeded {}));
        round_trip(Frame::StreamBlocked(StreamBlocked { stream_id: 3 }));
        round_trip(Frame::MaxData(MaxData {
            maximum_data: 1 << 40,
        }));
        round_trip(Frame::MaxStreamData(MaxStreamData {
            stream_id: 5,
            maximum_stream_data: 1 << 20,
        }));
        round_trip(Frame::MaxStreamId(MaxStreamId {
            maximum_stream_id: 65535,
        }));
        round_trip(Frame::ResetStream(ResetStream {
            stream_id: 9,
            error_code: 0x8000_0002,
            final_offset: 123_456,
        }));
        round_trip(Frame::StopSending(StopSending {
            stream_id: 9,
            error_code: 0x8000_0000,
        }));
        round_trip(Frame::NewConnectionId(NewConnectionId {
            sequence: 2,
            cnx_id: 0x1122_3344_5566_7788,
        }));
        round_trip(Frame::ConnectionClose(ConnectionClose {
            error_code: 0x8000_000a,
            reason: b"went away",
        }));
        round_trip(Frame::Stream(Stream {
            stream_id: 1,
            offset: 10,
            fin: true,
            explicit_length: true,
            data: b"stream bytes",
        }));
        round_trip(Frame::Ack(Ack {
            largest: 0x1234,
            delay_micros: 1000,
            first_block: 3,
            blocks: vec![ack::AckBlock { gap: 0, length: 2 }],
        }));
    }

    #[test]
    fn pure_ack_classification() {
        assert!(Frame::Padding(Padding { length: 1 }).is_pure_ack());
        assert!(Frame::Ack(Ack {
            largest: 1,
            delay_micros: 0,
            first_block: 0,
            blocks: Vec::new(),
        })
        .is_pure_ack());
        assert!(!Frame::Ping(Ping {}).is_pure_ack());
        assert!(!Frame::Stream(Stream {
            stream_id: 1,
            offset: 0,
            fin: false,
            explicit_length: false,
            data: b"x",
        })
        .is_pure_ack());
    }

    #[test]
    fn skip_reports_length_and_classification() {
        let mut storage = [0u8; 64];
        let mut encoder = EncoderBuffer::new(&mut storage);
        Frame::Ack(Ack {
            largest: 7,
            delay_micros: 0,
            first_block: 0,
            blocks: Vec::new(),
        })
        .encode(&mut encoder)
        .unwrap();
        let ack_len = encoder.len();
        Frame::Ping(Ping {}).encode(&mut encoder).unwrap();

        let buffer = DecoderBuffer::new(encoder.as_written());
        let (consumed, pure_ack) = skip(buffer).unwrap();
        assert_eq!(consumed, ack_len);
        assert!(pure_ack);

        let buffer = buffer.skip(consumed).unwrap();
        let (consumed, pure_ack) = skip(buffer).unwrap();
        assert_eq!(consumed, 1);
        assert!(!pure_ack);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        for tag in [0x03u8, 0x0d, 0x20, 0x9f] {
            let bytes = [tag, 0, 0, 0];
            assert!(Frame::decode(DecoderBuffer::new(&bytes)).is_err());
        }
    }
}
