// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use minquic_codec::{DecoderBuffer, DecoderBufferResult, EncoderBuffer, EncoderResult};

/// A run of zero octets. The decoder swallows consecutive padding in one
/// frame, so a padded tail parses as a single `Padding`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Padding {
    pub length: usize,
}

impl Padding {
    pub const TAG: crate::frame::Tag = crate::frame::TAG_PADDING;

    pub fn encode(&self, buffer: &mut EncoderBuffer) -> EncoderResult {
        for _ in 0..self.length {
            buffer.encode_u8(Self::TAG)?;
        }
        Ok(())
    }

    pub fn decode(buffer: DecoderBuffer) -> DecoderBufferResult<Self> {
        let mut length = 0;
        while buffer.peek_byte(length) == Ok(Self::TAG) {
            length += 1;
        }
        let buffer = buffer.skip(length)?;
        Ok((Self { length }, buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_collapse() {
        let bytes = [0, 0, 0, 0x07];
        let (frame, remaining) = Padding::decode(DecoderBuffer::new(&bytes)).unwrap();
        assert_eq!(frame.length, 3);
        assert_eq!(remaining.len(), 1);
    }
}
