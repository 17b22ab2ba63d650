// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet headers
//!
//! Two header forms exist on the wire. Handshake-era packets use the long
//! form: a type octet with the high bit set, an 8 byte connection id, a
//! 4 byte truncated packet number and the 4 byte version. Once 1-RTT keys
//! are installed the short form applies: connection-id-present and
//! key-phase flags plus a 1, 2 or 4 byte truncated packet number.

use minquic_codec::{DecoderBuffer, DecoderError, EncoderBuffer, EncoderResult};

pub mod number;

/// Upper bound for any datagram this endpoint produces or accepts
pub const MAX_PACKET_SIZE: usize = 1536;

/// Conservative pre-handshake payload budgets by address family
pub const INITIAL_MTU_IPV4: usize = 1252;
pub const INITIAL_MTU_IPV6: usize = 1232;

const LONG_HEADER_BIT: u8 = 0x80;
const SHORT_CNX_ID_BIT: u8 = 0x40;
const SHORT_KEY_PHASE_BIT: u8 = 0x20;

const LONG_HEADER_LEN: usize = 1 + 8 + 4 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    VersionNegotiation,
    ClientInitial,
    ServerStatelessRetry,
    ServerCleartext,
    ClientCleartext,
    ZeroRtt,
    PublicReset,
    OneRttProtectedPhi0,
    OneRttProtectedPhi1,
}

impl PacketType {
    pub const fn long_type(self) -> Option<u8> {
        match self {
            PacketType::VersionNegotiation => Some(1),
            PacketType::ClientInitial => Some(2),
            PacketType::ServerStatelessRetry => Some(3),
            PacketType::ServerCleartext => Some(4),
            PacketType::ClientCleartext => Some(5),
            PacketType::ZeroRtt => Some(6),
            PacketType::PublicReset => Some(9),
            PacketType::OneRttProtectedPhi0 | PacketType::OneRttProtectedPhi1 => None,
        }
    }

    const fn from_long_type(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::VersionNegotiation),
            2 => Some(PacketType::ClientInitial),
            3 => Some(PacketType::ServerStatelessRetry),
            4 => Some(PacketType::ServerCleartext),
            5 => Some(PacketType::ClientCleartext),
            6 => Some(PacketType::ZeroRtt),
            9 => Some(PacketType::PublicReset),
            _ => None,
        }
    }

    /// True for the two 1-RTT short-header types
    pub const fn is_protected(self) -> bool {
        matches!(
            self,
            PacketType::OneRttProtectedPhi0 | PacketType::OneRttProtectedPhi1
        )
    }

    /// Trailing bytes the protection layer adds: FNV-1a checksum on
    /// cleartext packets, AEAD tag on 1-RTT packets
    pub const fn checksum_overhead(self) -> usize {
        if self.is_protected() {
            crate::crypto::AEAD_TAG_LEN
        } else {
            crate::fnv1a::CHECKSUM_LEN
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    /// Absent only on short headers sent under `omit_connection_id`
    pub cnx_id: Option<u64>,
    /// Truncated packet number exactly as read; see [`number::expand`]
    pub packet_number: u64,
    /// Width of the truncated packet number in bits
    pub packet_number_bits: u32,
    /// Zero on short headers
    pub version: u32,
    pub header_len: usize,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Self, DecoderError> {
        let buffer = DecoderBuffer::new(bytes);
        let first = buffer.peek_byte(0)?;

        if first & LONG_HEADER_BIT != 0 {
            Self::parse_long(buffer, first)
        } else {
            Self::parse_short(buffer, first)
        }
    }

    fn parse_long(buffer: DecoderBuffer, first: u8) -> Result<Self, DecoderError> {
        let packet_type = PacketType::from_long_type(first & !LONG_HEADER_BIT)
            .ok_or(DecoderError::InvariantViolation("unknown long packet type"))?;
        let buffer = buffer.skip(1)?;
        let (cnx_id, buffer) = buffer.decode_u64()?;
        let (packet_number, buffer) = buffer.decode_u32()?;
        let (version, _) = buffer.decode_u32()?;

        Ok(Self {
            packet_type,
            cnx_id: Some(cnx_id),
            packet_number: packet_number.into(),
            packet_number_bits: 32,
            version,
            header_len: LONG_HEADER_LEN,
        })
    }

    fn parse_short(buffer: DecoderBuffer, first: u8) -> Result<Self, DecoderError> {
        let packet_type = if first & SHORT_KEY_PHASE_BIT == 0 {
            PacketType::OneRttProtectedPhi0
        } else {
            PacketType::OneRttProtectedPhi1
        };

        let pn_len: usize = match first & 0x1f {
            1 => 1,
            2 => 2,
            3 => 4,
            _ => {
                return Err(DecoderError::InvariantViolation(
                    "unknown short packet number length",
                ))
            }
        };

        let buffer = buffer.skip(1)?;
        let (cnx_id, buffer) = if first & SHORT_CNX_ID_BIT != 0 {
            let (cnx_id, buffer) = buffer.decode_u64()?;
            (Some(cnx_id), buffer)
        } else {
            (None, buffer)
        };
        let (packet_number, remaining) = buffer.decode_uint(pn_len)?;

        Ok(Self {
            packet_type,
            cnx_id,
            packet_number,
            packet_number_bits: pn_len as u32 * 8,
            version: 0,
            header_len: buffer.len() - remaining.len() + 1 + if cnx_id.is_some() { 8 } else { 0 },
        })
    }
}

/// Writes a long header, returning the header length
pub fn encode_long_header(
    buffer: &mut EncoderBuffer,
    packet_type: PacketType,
    cnx_id: u64,
    sequence: u64,
    version: u32,
) -> EncoderResult {
    let long_type = packet_type
        .long_type()
        .expect("short header types have no long form");
    buffer.encode_u8(LONG_HEADER_BIT | long_type)?;
    buffer.encode_u64(cnx_id)?;
    buffer.encode_u32(number::truncate(sequence, 32) as u32)?;
    buffer.encode_u32(version)?;
    Ok(())
}

/// Writes a short header with the 32-bit packet number variant
pub fn encode_short_header(
    buffer: &mut EncoderBuffer,
    cnx_id: Option<u64>,
    key_phase: bool,
    sequence: u64,
) -> EncoderResult {
    let mut first = 0x03u8;
    if cnx_id.is_some() {
        first |= SHORT_CNX_ID_BIT;
    }
    if key_phase {
        first |= SHORT_KEY_PHASE_BIT;
    }
    buffer.encode_u8(first)?;
    if let Some(cnx_id) = cnx_id {
        buffer.encode_u64(cnx_id)?;
    }
    buffer.encode_u32(number::truncate(sequence, 32) as u32)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_header_round_trip() {
        let mut storage = [0u8; 32];
        let mut encoder = EncoderBuffer::new(&mut storage);
        encode_long_header(
            &mut encoder,
            PacketType::ClientInitial,
            0x0123_4567_89ab_cdef,
            0xdead_beef_0042_4242,
            crate::FIRST_INTEROP_VERSION,
        )
        .unwrap();
        assert_eq!(encoder.len(), LONG_HEADER_LEN);

        let header = Header::parse(encoder.as_written()).unwrap();
        assert_eq!(header.packet_type, PacketType::ClientInitial);
        assert_eq!(header.cnx_id, Some(0x0123_4567_89ab_cdef));
        assert_eq!(header.packet_number, 0x0042_4242);
        assert_eq!(header.packet_number_bits, 32);
        assert_eq!(header.version, crate::FIRST_INTEROP_VERSION);
        assert_eq!(header.header_len, LONG_HEADER_LEN);
    }

    #[test]
    fn short_header_round_trip() {
        for (cnx_id, key_phase) in [(None, false), (Some(7u64), true)] {
            let mut storage = [0u8; 32];
            let mut encoder = EncoderBuffer::new(&mut storage);
            encode_short_header(&mut encoder, cnx_id, key_phase, 0x1_0000_0007).unwrap();

            let header = Header::parse(encoder.as_written()).unwrap();
            assert_eq!(header.cnx_id, cnx_id);
            assert_eq!(header.packet_number, 0x0000_0007);
            assert_eq!(header.packet_number_bits, 32);
            assert_eq!(
                header.packet_type,
                if key_phase {
                    PacketType::OneRttProtectedPhi1
                } else {
                    PacketType::OneRttProtectedPhi0
                }
            );
            assert_eq!(header.header_len, encoder.len());
        }
    }

    #[test]
    fn unknown_types_are_rejected() {
        // long type 7 is unassigned
        assert!(Header::parse(&[0x87; 17]).is_err());
        // short packet number length 4 is unassigned
        assert!(Header::parse(&[0x44; 13]).is_err());
        // truncated header
        assert!(Header::parse(&[0x82, 0x00]).is_err());
    }
}
