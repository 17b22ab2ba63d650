// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Congestion control interface and the default NewReno controller
//!
//! The sender notifies the controller on acknowledgement, repeat, timeout
//! and RTT events; the controller only answers one question: how large is
//! the congestion window right now. Algorithms are pluggable through the
//! factory installed on the endpoint.

use alloc::boxed::Box;
use core::{fmt, time::Duration};
use minquic_core::packet::MAX_PACKET_SIZE;

/// Initial and floor window sizes
pub const CWIN_INITIAL: u64 = 10 * MAX_PACKET_SIZE as u64;
pub const CWIN_MIN: u64 = 2 * MAX_PACKET_SIZE as u64;

/// Loss-recovery and ACK events the sender reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Packets totalling `bytes` were newly acknowledged
    Acknowledged { bytes: u64 },
    /// A packet was declared lost by SACK or RACK reordering logic
    Repeat { lost_sequence: u64 },
    /// A packet was declared lost by the retransmission timer
    Timeout { lost_sequence: u64 },
    /// A retransmission later proved unnecessary
    SpuriousRepeat,
    /// A fresh RTT sample was taken
    RttMeasurement { rtt: Duration },
}

pub trait Controller: fmt::Debug {
    /// Current congestion window in bytes
    fn congestion_window(&self) -> u64;

    fn notify(&mut self, event: Event);
}

/// Constructor for per-connection controller state
pub type Factory = fn() -> Box<dyn Controller>;

pub fn new_reno_factory() -> Box<dyn Controller> {
    Box::new(NewReno::new())
}

/// Plain NewReno: slow start up to `ssthresh`, additive increase past it,
/// multiplicative decrease on loss, collapse to the floor on timeout.
#[derive(Debug)]
pub struct NewReno {
    cwin: u64,
    ssthresh: u64,
    /// End of the current recovery period, so one loss burst only halves
    /// the window once
    recovery_end: Option<u64>,
}

impl NewReno {
    pub fn new() -> Self {
        Self {
            cwin: CWIN_INITIAL,
            ssthresh: u64::MAX,
            recovery_end: None,
        }
    }

    fn enter_recovery(&mut self, lost_sequence: u64) -> bool {
        if let Some(end) = self.recovery_end {
            if lost_sequence < end {
                return false;
            }
        }
        self.recovery_end = Some(lost_sequence);
        true
    }
}

impl Default for NewReno {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller for NewReno {
    fn congestion_window(&self) -> u64 {
        self.cwin
    }

    fn notify(&mut self, event: Event) {
        match event {
            Event::Acknowledged { bytes } => {
                if self.cwin < self.ssthresh {
                    self.cwin += bytes;
                } else {
                    self.cwin += (MAX_PACKET_SIZE as u64 * bytes) / self.cwin.max(1);
                }
            }
            Event::Repeat { lost_sequence } => {
                if self.enter_recovery(lost_sequence) {
                    self.cwin = (self.cwin / 2).max(CWIN_MIN);
                    self.ssthresh = self.cwin;
                }
            }
            Event::Timeout { lost_sequence } => {
                if self.enter_recovery(lost_sequence) {
                    self.ssthresh = (self.cwin / 2).max(CWIN_MIN);
                    self.cwin = CWIN_MIN;
                }
            }
            Event::SpuriousRepeat | Event::RttMeasurement { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_doubles_per_window() {
        let mut cc = NewReno::new();
        let start = cc.congestion_window();
        cc.notify(Event::Acknowledged { bytes: start });
        assert_eq!(cc.congestion_window(), 2 * start);
    }

    #[test]
    fn loss_halves_once_per_recovery_period() {
        let mut cc = NewReno::new();
        let start = cc.congestion_window();
        cc.notify(Event::Repeat { lost_sequence: 10 });
        assert_eq!(cc.congestion_window(), start / 2);
        // more losses from the same flight do not halve again
        cc.notify(Event::Repeat { lost_sequence: 5 });
        assert_eq!(cc.congestion_window(), start / 2);
        // a loss past the recovery point does
        cc.notify(Event::Repeat { lost_sequence: 11 });
        assert_eq!(cc.congestion_window(), start / 4);
    }

    #[test]
    fn timeout_collapses_the_window() {
        let mut cc = NewReno::new();
        cc.notify(Event::Timeout { lost_sequence: 1 });
        assert_eq!(cc.congestion_window(), CWIN_MIN);
    }

    #[test]
    fn congestion_avoidance_grows_linearly() {
        let mut cc = NewReno::new();
        // a repeat puts the window at ssthresh, leaving slow start
        cc.notify(Event::Repeat { lost_sequence: 1 });
        let window = cc.congestion_window();
        cc.notify(Event::Acknowledged { bytes: window });
        assert_eq!(
            cc.congestion_window(),
            window + MAX_PACKET_SIZE as u64,
            "one MTU per window worth of acks"
        );
    }
}
