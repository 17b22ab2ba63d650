// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use minquic_codec::{DecoderBuffer, DecoderBufferResult, EncoderBuffer, EncoderError, EncoderResult};

/// Notifies the peer that the connection is being closed. The error code
/// is one of the transport codes in [`crate::transport`]; the reason is an
/// optional UTF-8 diagnostic that is never interpreted by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionClose<'a> {
    pub error_code: u32,
    pub reason: &'a [u8],
}

impl<'a> ConnectionClose<'a> {
    pub const TAG: crate::frame::Tag = crate::frame::TAG_CONNECTION_CLOSE;

    pub fn encode(&self, buffer: &mut EncoderBuffer) -> EncoderResult {
        let reason_len =
            u16::try_from(self.reason.len()).map_err(|_| EncoderError::CapacityExceeded)?;
        buffer.encode_u8(Self::TAG)?;
        buffer.encode_u32(self.error_code)?;
        buffer.encode_u16(reason_len)?;
        buffer.encode_slice(self.reason)?;
        Ok(())
    }

    pub fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let (error_code, buffer) = buffer.decode_u32()?;
        let (reason_len, buffer) = buffer.decode_u16()?;
        let (reason, buffer) = buffer.decode_slice(reason_len.into())?;
        Ok((Self { error_code, reason }, buffer))
    }
}
