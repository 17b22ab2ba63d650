// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport parameter extension codec
//!
//! The parameters travel inside TLS extension 26 as a 16-bit
//! length-prefixed list of `{id: u16, len: u16, value}` entries. Unknown
//! ids are skipped for forward compatibility; duplicates and truncated
//! values are errors.

use crate::{packet::MAX_PACKET_SIZE, transport::Error};
use minquic_codec::{DecoderBuffer, EncoderBuffer, EncoderError};

/// TLS extension number carrying the parameter list
pub const TRANSPORT_PARAMETERS_TLS_EXTENSION: u16 = 26;

const ID_INITIAL_MAX_STREAM_DATA: u16 = 0;
const ID_INITIAL_MAX_DATA: u16 = 1;
const ID_INITIAL_MAX_STREAM_ID: u16 = 2;
const ID_IDLE_TIMEOUT: u16 = 3;
const ID_OMIT_CONNECTION_ID: u16 = 4;
const ID_MAX_PACKET_SIZE: u16 = 5;
const ID_STATELESS_RESET_TOKEN: u16 = 6;

pub const RESET_TOKEN_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportParameters {
    /// Per-stream flow control limit, bytes
    pub initial_max_stream_data: u32,
    /// Connection-wide flow control limit, KiB
    pub initial_max_data: u32,
    pub initial_max_stream_id: u32,
    /// Seconds of silence before the connection is abandoned
    pub idle_timeout: u16,
    /// Ask the peer to drop the connection id from short headers
    pub omit_connection_id: bool,
    pub max_packet_size: u16,
    /// Only ever sent by servers
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_LEN]>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            initial_max_stream_data: 65535,
            initial_max_data: 0x10_0000,
            initial_max_stream_id: 65535,
            idle_timeout: 30,
            omit_connection_id: false,
            max_packet_size: (MAX_PACKET_SIZE - 16 - 40) as u16,
            stateless_reset_token: None,
        }
    }
}

impl TransportParameters {
    /// Connection-wide limit in bytes (the wire carries KiB)
    #[inline]
    pub fn initial_max_data_bytes(&self) -> u64 {
        u64::from(self.initial_max_data) << 10
    }

    /// Serializes the extension body
    pub fn encode(&self, buffer: &mut EncoderBuffer) -> Result<(), EncoderError> {
        let list_start = buffer.len();
        buffer.encode_u16(0)?;

        buffer.encode_u16(ID_INITIAL_MAX_STREAM_DATA)?;
        buffer.encode_u16(4)?;
        buffer.encode_u32(self.initial_max_stream_data)?;

        buffer.encode_u16(ID_INITIAL_MAX_DATA)?;
        buffer.encode_u16(4)?;
        buffer.encode_u32(self.initial_max_data)?;

        buffer.encode_u16(ID_INITIAL_MAX_STREAM_ID)?;
        buffer.encode_u16(4)?;
        buffer.encode_u32(self.initial_max_stream_id)?;

        buffer.encode_u16(ID_IDLE_TIMEOUT)?;
        buffer.encode_u16(2)?;
        buffer.encode_u16(self.idle_timeout)?;

        if self.omit_connection_id {
            buffer.encode_u16(ID_OMIT_CONNECTION_ID)?;
            buffer.encode_u16(0)?;
        }

        buffer.encode_u16(ID_MAX_PACKET_SIZE)?;
        buffer.encode_u16(2)?;
        buffer.encode_u16(self.max_packet_size)?;

        if let Some(token) = &self.stateless_reset_token {
            buffer.encode_u16(ID_STATELESS_RESET_TOKEN)?;
            buffer.encode_u16(RESET_TOKEN_LEN as u16)?;
            buffer.encode_slice(token)?;
        }

        let list_len = buffer.len() - list_start - 2;
        buffer.encode_u16_at(list_start, list_len as u16)?;
        Ok(())
    }

    /// Parses an extension body received from the peer. `from_server`
    /// selects which parameters are legal: only servers may send a
    /// stateless reset token.
    pub fn decode(bytes: &[u8], from_server: bool) -> Result<Self, Error> {
        let buffer = DecoderBuffer::new(bytes);
        let (list_len, buffer) = buffer.decode_u16().map_err(tp_error)?;
        let (list, trailing) = buffer.decode_slice(list_len.into()).map_err(tp_error)?;
        trailing
            .ensure_empty()
            .map_err(|_| Error::new(Error::TRANSPORT_PARAMETER_ERROR, "trailing extension bytes"))?;

        let mut params = Self::default();
        let mut seen = [false; 7];
        let mut list = DecoderBuffer::new(list);

        while !list.is_empty() {
            let (id, rest) = list.decode_u16().map_err(tp_error)?;
            let (len, rest) = rest.decode_u16().map_err(tp_error)?;
            let (value, rest) = rest.decode_slice(len.into()).map_err(tp_error)?;
            list = rest;

            if let Some(flag) = seen.get_mut(usize::from(id)) {
                if *flag {
                    return Err(Error::new(
                        Error::TRANSPORT_PARAMETER_ERROR,
                        "duplicate transport parameter",
                    ));
                }
                *flag = true;
            } else {
                // unknown parameter: skip
                continue;
            }

            let value = DecoderBuffer::new(value);
            match id {
                ID_INITIAL_MAX_STREAM_DATA => {
                    params.initial_max_stream_data = decode_exact_u32(value)?;
                }
                ID_INITIAL_MAX_DATA => {
                    params.initial_max_data = decode_exact_u32(value)?;
                }
                ID_INITIAL_MAX_STREAM_ID => {
                    params.initial_max_stream_id = decode_exact_u32(value)?;
                }
                ID_IDLE_TIMEOUT => {
                    params.idle_timeout = decode_exact_u16(value)?;
                }
                ID_OMIT_CONNECTION_ID => {
                    value.ensure_empty().map_err(tp_error)?;
                    params.omit_connection_id = true;
                }
                ID_MAX_PACKET_SIZE => {
                    params.max_packet_size = decode_exact_u16(value)?;
                }
                ID_STATELESS_RESET_TOKEN => {
                    if !from_server {
                        return Err(Error::new(
                            Error::TRANSPORT_PARAMETER_ERROR,
                            "client sent a stateless reset token",
                        ));
                    }
                    let (token, rest) =
                        value.decode_slice(RESET_TOKEN_LEN).map_err(tp_error)?;
                    rest.ensure_empty().map_err(tp_error)?;
                    let mut bytes = [0u8; RESET_TOKEN_LEN];
                    bytes.copy_from_slice(token);
                    params.stateless_reset_token = Some(bytes);
                }
                _ => unreachable!("filtered by the seen table"),
            }
        }

        Ok(params)
    }
}

fn tp_error(_: minquic_codec::DecoderError) -> Error {
    Error::new(Error::TRANSPORT_PARAMETER_ERROR, "malformed transport parameters")
}

fn decode_exact_u32(value: DecoderBuffer) -> Result<u32, Error> {
    let (decoded, rest) = value.decode_u32().map_err(tp_error)?;
    rest.ensure_empty().map_err(tp_error)?;
    Ok(decoded)
}

fn decode_exact_u16(value: DecoderBuffer) -> Result<u16, Error> {
    let (decoded, rest) = value.decode_u16().map_err(tp_error)?;
    rest.ensure_empty().map_err(tp_error)?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(params: &TransportParameters) -> Vec<u8> {
        let mut storage = [0u8; 256];
        let mut encoder = EncoderBuffer::new(&mut storage);
        params.encode(&mut encoder).unwrap();
        encoder.as_written().to_vec()
    }

    #[test]
    fn round_trip_defaults() {
        let params = TransportParameters::default();
        let bytes = encode(&params);
        assert_eq!(TransportParameters::decode(&bytes, true).unwrap(), params);
    }

    #[test]
    fn round_trip_server_parameters() {
        let params = TransportParameters {
            initial_max_stream_data: 1 << 20,
            initial_max_data: 4096,
            initial_max_stream_id: 17,
            idle_timeout: 600,
            omit_connection_id: true,
            max_packet_size: 1280,
            stateless_reset_token: Some([0xa5; RESET_TOKEN_LEN]),
        };
        let bytes = encode(&params);
        assert_eq!(TransportParameters::decode(&bytes, true).unwrap(), params);
    }

    #[test]
    fn client_may_not_send_a_reset_token() {
        let params = TransportParameters {
            stateless_reset_token: Some([1; RESET_TOKEN_LEN]),
            ..Default::default()
        };
        let bytes = encode(&params);
        let error = TransportParameters::decode(&bytes, false).unwrap_err();
        assert_eq!(error.code, Error::TRANSPORT_PARAMETER_ERROR);
    }

    #[test]
    fn absent_parameters_use_defaults() {
        // empty list
        let bytes = [0u8, 0];
        let params = TransportParameters::decode(&bytes, true).unwrap();
        assert_eq!(params, TransportParameters::default());
        assert_eq!(params.initial_max_data_bytes(), 0x10_0000 << 10);
        assert_eq!(params.max_packet_size, 1480);
    }

    #[test]
    fn unknown_parameters_are_skipped() {
        // id 0x7fff, two value bytes, then idle_timeout = 60
        let bytes = [
            0x00, 0x0c, // list length
            0x7f, 0xff, 0x00, 0x02, 0xab, 0xcd, // unknown entry
            0x00, 0x03, 0x00, 0x02, 0x00, 0x3c, // idle timeout
        ];
        let params = TransportParameters::decode(&bytes, false).unwrap();
        assert_eq!(params.idle_timeout, 60);
    }

    #[test]
    fn duplicates_and_bad_widths_are_rejected() {
        let duplicate = [
            0x00, 0x0c, // list length
            0x00, 0x03, 0x00, 0x02, 0x00, 0x3c, // idle timeout
            0x00, 0x03, 0x00, 0x02, 0x00, 0x3c, // again
        ];
        assert!(TransportParameters::decode(&duplicate, false).is_err());

        let narrow = [
            0x00, 0x05, // list length
            0x00, 0x01, 0x00, 0x01, 0xff, // max data in one byte
        ];
        assert!(TransportParameters::decode(&narrow, false).is_err());
    }
}
