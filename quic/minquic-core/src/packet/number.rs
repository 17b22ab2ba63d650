// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Truncated packet number reconstruction
//!
//! Short headers carry only the low 8/16/32 bits of the 64 bit sequence
//! number; the receiver reconstructs the full value closest to one more
//! than the highest number it has seen, ties going to the higher candidate.

/// Expands a `bits`-wide truncated packet number against the largest
/// previously received full number.
#[inline]
pub fn expand(truncated: u64, bits: u32, largest: u64) -> u64 {
    debug_assert!(bits > 0 && bits < 64);

    let expected = largest.wrapping_add(1);
    let win = 1u64 << bits;
    let hwin = win >> 1;
    let mask = win - 1;

    let candidate = (expected & !mask) | (truncated & mask);

    if expected
        .checked_sub(hwin)
        .is_some_and(|low| candidate <= low)
    {
        if let Some(higher) = candidate.checked_add(win) {
            return higher;
        }
    }

    if candidate > expected.saturating_add(hwin) {
        if let Some(lower) = candidate.checked_sub(win) {
            return lower;
        }
    }

    candidate
}

/// Truncates a full sequence number to its low `bits`
#[inline]
pub fn truncate(sequence: u64, bits: u32) -> u64 {
    debug_assert!(bits > 0 && bits < 64);
    sequence & ((1u64 << bits) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::check;

    #[test]
    fn example_from_header_parsing() {
        // highest received 0xa82f30ea, 16-bit value 0x9b32
        assert_eq!(expand(0x9b32, 16, 0xa82f_30ea), 0xa82f_9b32);
    }

    #[test]
    fn wrap_down() {
        // truncated value just behind the window start resolves backwards
        assert_eq!(expand(0xff, 8, 0x1_00), 0xff);
        // and just ahead resolves forwards across the boundary
        assert_eq!(expand(0x01, 8, 0x1_ff), 0x2_01);
    }

    #[test]
    fn ties_prefer_the_higher_candidate() {
        // candidate == expected - hwin exactly: both candidates are hwin
        // away from expected, the higher one wins
        let largest = 0x17f;
        let expanded = expand(0x00, 8, largest);
        assert_eq!(expanded, 0x200);
    }

    #[test]
    fn round_trip_within_half_window() {
        check!()
            .with_type::<(u64, u64)>()
            .cloned()
            .for_each(|(sequence, largest)| {
                for bits in [8u32, 16, 32] {
                    let hwin = 1u64 << (bits - 1);
                    let distance = sequence.abs_diff(largest.wrapping_add(1));
                    if distance < hwin {
                        let truncated = truncate(sequence, bits);
                        assert_eq!(expand(truncated, bits, largest), sequence);
                    }
                }
            });
    }
}
