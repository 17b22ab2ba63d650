// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Time datatypes for the transport
//!
//! The whole core runs on a caller-provided microsecond clock; nothing in
//! here reads the system time.

use core::{fmt, ops, time::Duration};

/// An absolute point in time, measured in microseconds from an arbitrary
/// epoch chosen by the embedder's clock.
///
/// `Timestamp`s should only be compared when sourced from the same clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    #[inline]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        u64::try_from(duration.as_micros())
            .ok()
            .and_then(|micros| self.0.checked_add(micros))
            .map(Self)
    }

    /// Duration elapsed since `earlier`, zero if `earlier` is in the future
    #[inline]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, duration: Duration) -> Self {
        self.checked_add(duration)
            .expect("timestamp overflowed the clock range")
    }
}

impl ops::Sub<Timestamp> for Timestamp {
    type Output = Duration;

    #[inline]
    fn sub(self, earlier: Timestamp) -> Duration {
        self.saturating_duration_since(earlier)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let secs = self.0 / 1_000_000;
        let micros = self.0 % 1_000_000;
        write!(f, "{secs}.{micros:06}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        let start = Timestamp::from_micros(1_000);
        let later = start + Duration::from_millis(2);
        assert_eq!(later.as_micros(), 3_000);
        assert_eq!(later - start, Duration::from_micros(2_000));
        // saturating: no panic when the order is reversed
        assert_eq!(start - later, Duration::ZERO);
        assert!(Timestamp::from_micros(u64::MAX)
            .checked_add(Duration::from_micros(1))
            .is_none());
    }
}
