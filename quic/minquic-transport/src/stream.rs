// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-stream state: ordered reassembly of received fragments and the
//! FIFO of outbound data
//!
//! Receive side: fragments land in a map keyed by offset, trimmed against
//! the consumed prefix and against each other so that arbitrary overlap
//! never duplicates application-visible bytes. The consumed offset only
//! ever moves forward, across data that is contiguous from it.
//!
//! Send side: the application appends, the sender drains in order,
//! splitting but never reordering. Retransmission works on stored packet
//! images, so nothing here needs to remember sent bytes.

use alloc::{
    collections::{BTreeMap, VecDeque},
    vec::Vec,
};
use bytes::Bytes;
use minquic_core::transport::Error;

/// Events delivered through the stream-data callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackEvent {
    /// Ordinary data bytes
    Data,
    /// The final byte of the stream was delivered
    Fin,
    /// The peer reset the stream
    Reset,
    /// The connection is gone
    Close,
}

#[derive(Debug)]
pub(crate) struct Stream {
    pub stream_id: u32,

    // receive side
    fragments: BTreeMap<u64, Vec<u8>>,
    pub consumed_offset: u64,
    pub highest_received: u64,
    pub fin_offset: Option<u64>,
    pub fin_received: bool,
    pub fin_signalled: bool,

    // send side
    send_queue: VecDeque<Bytes>,
    pub sent_offset: u64,
    pub fin_requested: bool,
    pub fin_sent: bool,

    // reset handling
    pub reset_requested: bool,
    pub reset_sent: bool,
    pub reset_received: bool,
    pub reset_signalled: bool,
    pub local_error: Option<u32>,
    pub remote_error: Option<u32>,

    // flow control
    pub maxdata_local: u64,
    pub maxdata_remote: u64,
}

impl Stream {
    pub fn new(stream_id: u32, maxdata_local: u64, maxdata_remote: u64) -> Self {
        Self {
            stream_id,
            fragments: BTreeMap::new(),
            consumed_offset: 0,
            highest_received: 0,
            fin_offset: None,
            fin_received: false,
            fin_signalled: false,
            send_queue: VecDeque::new(),
            sent_offset: 0,
            fin_requested: false,
            fin_sent: false,
            reset_requested: false,
            reset_sent: false,
            reset_received: false,
            reset_signalled: false,
            local_error: None,
            remote_error: None,
            maxdata_local,
            maxdata_remote,
        }
    }

    /// Accepts a received STREAM frame. Returns the number of bytes that
    /// newly count against connection-level flow control (the extension
    /// of the highest received offset).
    pub fn receive(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<u64, Error> {
        let extent = offset + data.len() as u64;

        if fin {
            if extent < self.consumed_offset {
                return Err(Error::new(
                    Error::FINAL_OFFSET_ERROR,
                    "fin below the consumed offset",
                ));
            }
            if let Some(final_offset) = self.fin_offset {
                if final_offset != extent {
                    return Err(Error::new(
                        Error::FINAL_OFFSET_ERROR,
                        "fin moved the final offset",
                    ));
                }
            } else if extent < self.highest_received {
                return Err(Error::new(
                    Error::FINAL_OFFSET_ERROR,
                    "fin below received data",
                ));
            }
            self.fin_offset = Some(extent);
            self.fin_received = true;
        } else if let Some(final_offset) = self.fin_offset {
            if extent > final_offset {
                return Err(Error::new(
                    Error::FINAL_OFFSET_ERROR,
                    "data beyond the final offset",
                ));
            }
        }

        if extent > self.maxdata_local {
            return Err(Error::new(
                Error::FLOW_CONTROL_ERROR,
                "stream flow control limit exceeded",
            ));
        }

        let newly_received = extent.saturating_sub(self.highest_received);
        self.highest_received = self.highest_received.max(extent);

        self.insert_fragment(offset, data);
        Ok(newly_received)
    }

    /// Stores `data` at `offset`, clipped against the consumed prefix and
    /// every already-buffered fragment
    fn insert_fragment(&mut self, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;
        let mut cursor = offset.max(self.consumed_offset);

        while cursor < end {
            // a fragment at or below the cursor may already cover it
            if let Some((start, fragment)) = self.fragments.range(..=cursor).next_back() {
                let covered_end = start + fragment.len() as u64;
                if covered_end > cursor {
                    cursor = covered_end;
                    continue;
                }
            }

            // free space runs to the next stored fragment or the end
            let gap_end = self
                .fragments
                .range(cursor..)
                .next()
                .map(|(start, _)| *start)
                .unwrap_or(u64::MAX)
                .min(end);

            let from = (cursor - offset) as usize;
            let to = (gap_end - offset) as usize;
            self.fragments.insert(cursor, data[from..to].to_vec());
            cursor = gap_end;
        }
    }

    /// Drains bytes that are contiguous from the consumed offset,
    /// advancing it. The `bool` reports that the fin was reached.
    pub fn deliverable(&mut self) -> Option<(Vec<u8>, bool)> {
        let mut delivered = Vec::new();

        while let Some((&start, _)) = self.fragments.first_key_value() {
            if start > self.consumed_offset {
                break;
            }
            let fragment = self.fragments.remove(&start).expect("key just observed");
            // fragments never start below the consumed offset
            debug_assert_eq!(start, self.consumed_offset);
            self.consumed_offset += fragment.len() as u64;
            delivered.extend_from_slice(&fragment);
        }

        let fin_reached = !self.fin_signalled && self.fin_offset == Some(self.consumed_offset);
        if fin_reached {
            self.fin_signalled = true;
        }

        if delivered.is_empty() && !fin_reached {
            None
        } else {
            Some((delivered, fin_reached))
        }
    }

    /// Appends application data, optionally finishing the stream
    pub fn enqueue(&mut self, data: &[u8], fin: bool) {
        debug_assert!(!self.fin_requested && !self.reset_requested);
        if !data.is_empty() {
            self.send_queue.push_back(Bytes::copy_from_slice(data));
        }
        if fin {
            self.fin_requested = true;
        }
    }

    /// Bytes waiting to be sent
    pub fn pending_send(&self) -> usize {
        self.send_queue.iter().map(Bytes::len).sum()
    }

    /// True when the sender should visit this stream
    pub fn is_ready_to_send(&self) -> bool {
        if self.reset_requested && !self.reset_sent {
            return true;
        }
        if self.reset_requested || self.reset_sent {
            return false;
        }
        if !self.send_queue.is_empty() && self.sent_offset < self.maxdata_remote {
            return true;
        }
        self.fin_requested && !self.fin_sent && self.send_queue.is_empty()
    }

    /// Takes up to `max_len` bytes off the send queue. Returns the wire
    /// offset, the bytes, and whether the fin travels with them. The fin
    /// flag is only raised when this call empties the queue.
    pub fn next_send(&mut self, max_len: usize) -> (u64, Bytes, bool) {
        let offset = self.sent_offset;
        let mut data = Bytes::new();

        if let Some(front) = self.send_queue.front_mut() {
            if front.len() <= max_len {
                data = self.send_queue.pop_front().expect("front just observed");
            } else if max_len > 0 {
                data = front.split_to(max_len);
            }
        }

        self.sent_offset += data.len() as u64;

        let fin = self.fin_requested && !self.fin_sent && self.send_queue.is_empty();
        if fin {
            self.fin_sent = true;
        }
        (offset, data, fin)
    }

    /// Drops all transfer state; used when version renegotiation restarts
    /// the handshake stream
    pub fn reset_transfer_state(&mut self) {
        self.fragments.clear();
        self.consumed_offset = 0;
        self.highest_received = 0;
        self.fin_offset = None;
        self.fin_received = false;
        self.fin_signalled = false;
        self.send_queue.clear();
        self.sent_offset = 0;
        self.fin_requested = false;
        self.fin_sent = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Stream {
        Stream::new(1, u64::MAX, u64::MAX)
    }

    fn drain(stream: &mut Stream) -> (Vec<u8>, bool) {
        let mut bytes = Vec::new();
        let mut fin = false;
        while let Some((chunk, fin_reached)) = stream.deliverable() {
            bytes.extend_from_slice(&chunk);
            fin |= fin_reached;
        }
        (bytes, fin)
    }

    #[test]
    fn reversed_fragments_reassemble() {
        let mut stream = stream();
        let data: Vec<u8> = (1..=50).collect();

        for chunk in [4usize, 3, 2, 1, 0] {
            let offset = chunk as u64 * 10;
            stream
                .receive(offset, &data[chunk * 10..chunk * 10 + 10], false)
                .unwrap();
        }

        let (bytes, fin) = drain(&mut stream);
        assert_eq!(stream.consumed_offset, 50);
        assert_eq!(bytes, data);
        assert!(!fin);
    }

    #[test]
    fn overlaps_never_duplicate_bytes() {
        let mut stream = stream();
        stream.receive(0, b"abcde", false).unwrap();
        stream.receive(3, b"deFGH", false).unwrap();
        stream.receive(0, b"XXXXXXXX", false).unwrap();
        stream.receive(10, b"KL", false).unwrap();
        stream.receive(6, b"GHijKL", false).unwrap();

        let (bytes, _) = drain(&mut stream);
        // first writer of each region wins
        assert_eq!(&bytes, b"abcdeFGHijKL");
        assert_eq!(stream.consumed_offset, 12);
    }

    #[test]
    fn data_below_consumed_is_discarded() {
        let mut stream = stream();
        stream.receive(0, b"hello", false).unwrap();
        drain(&mut stream);
        assert_eq!(stream.consumed_offset, 5);

        stream.receive(0, b"hello", false).unwrap();
        assert!(stream.deliverable().is_none());
        // partial overlap with the consumed prefix delivers the tail only
        stream.receive(3, b"lo!", false).unwrap();
        let (bytes, _) = drain(&mut stream);
        assert_eq!(&bytes, b"!");
    }

    #[test]
    fn fin_is_reported_once_consumed_reaches_it() {
        let mut stream = stream();
        stream.receive(5, b"world", true).unwrap();
        assert!(stream.deliverable().is_none());

        stream.receive(0, b"hello", false).unwrap();
        let (bytes, fin) = drain(&mut stream);
        assert_eq!(&bytes, b"helloworld");
        assert!(fin);
        // fin is signalled exactly once
        assert!(stream.deliverable().is_none());
    }

    #[test]
    fn empty_fin_frame_closes_the_stream() {
        let mut stream = stream();
        stream.receive(0, b"payload", false).unwrap();
        drain(&mut stream);
        stream.receive(7, b"", true).unwrap();
        let (bytes, fin) = drain(&mut stream).clone();
        assert!(bytes.is_empty());
        assert!(fin);
    }

    #[test]
    fn final_offset_violations() {
        let mut stream = stream();
        stream.receive(0, b"0123456789", true).unwrap();

        // moving the fin is an error
        let error = stream.receive(0, b"01234", true).unwrap_err();
        assert_eq!(error.code, Error::FINAL_OFFSET_ERROR);

        // data past the fin is an error
        let error = stream.receive(10, b"more", false).unwrap_err();
        assert_eq!(error.code, Error::FINAL_OFFSET_ERROR);

        // fin below already received data is an error
        let mut stream = Stream::new(1, u64::MAX, u64::MAX);
        stream.receive(0, b"0123456789", false).unwrap();
        let error = stream.receive(0, b"0123", true).unwrap_err();
        assert_eq!(error.code, Error::FINAL_OFFSET_ERROR);
    }

    #[test]
    fn stream_flow_control_is_enforced() {
        let mut stream = Stream::new(1, 10, u64::MAX);
        assert_eq!(stream.receive(0, b"0123456789", false).unwrap(), 10);
        let error = stream.receive(10, b"x", false).unwrap_err();
        assert_eq!(error.code, Error::FLOW_CONTROL_ERROR);
        // retransmits of old data do not count again
        assert_eq!(stream.receive(0, b"0123456789", false).unwrap(), 0);
    }

    #[test]
    fn random_fragments_match_a_coverage_model() {
        use bolero::check;

        // the sender's byte at offset `o` is always `o % 251`, so any
        // overlap pattern must still deliver that exact sequence
        check!()
            .with_type::<Vec<(u16, u8)>>()
            .cloned()
            .for_each(|fragments| {
                let mut stream = Stream::new(1, u64::MAX, u64::MAX);
                let mut covered = vec![false; 1024];
                let mut delivered = Vec::new();

                for (offset, len) in fragments {
                    let offset = u64::from(offset % 768);
                    let len = usize::from(len % 64);
                    let data: Vec<u8> = (offset..offset + len as u64)
                        .map(|position| (position % 251) as u8)
                        .collect();

                    stream.receive(offset, &data, false).unwrap();
                    for position in offset as usize..offset as usize + len {
                        covered[position] = true;
                    }
                    while let Some((chunk, _)) = stream.deliverable() {
                        delivered.extend_from_slice(&chunk);
                    }
                }

                let expected_consumed =
                    covered.iter().position(|seen| !seen).unwrap_or(covered.len());
                assert_eq!(stream.consumed_offset as usize, expected_consumed);
                assert_eq!(delivered.len(), expected_consumed);
                for (position, byte) in delivered.iter().enumerate() {
                    assert_eq!(*byte, (position % 251) as u8);
                }
            });
    }

    #[test]
    fn send_queue_splits_but_keeps_order() {
        let mut stream = stream();
        stream.enqueue(b"hello ", false);
        stream.enqueue(b"world", true);

        let (offset, data, fin) = stream.next_send(4);
        assert_eq!((offset, &data[..], fin), (0, &b"hell"[..], false));
        let (offset, data, fin) = stream.next_send(100);
        assert_eq!((offset, &data[..], fin), (4, &b"o "[..], false));
        let (offset, data, fin) = stream.next_send(100);
        assert_eq!((offset, &data[..], fin), (6, &b"world"[..], true));
        assert!(!stream.is_ready_to_send());
    }

    #[test]
    fn fin_only_send() {
        let mut stream = stream();
        stream.enqueue(b"", true);
        assert!(stream.is_ready_to_send());
        let (offset, data, fin) = stream.next_send(100);
        assert_eq!((offset, data.len(), fin), (0, 0, true));
        assert!(!stream.is_ready_to_send());
    }
}
