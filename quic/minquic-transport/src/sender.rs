// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet assembly, loss recovery and pacing
//!
//! `prepare_packet` is the single producer of datagrams for a connection.
//! It first services the retransmission queue (oldest packet first,
//! strictly in order), then packs control frames and fresh stream data
//! under the congestion window, protects the result, and recomputes the
//! connection's next wake time.

use crate::{
    congestion,
    connection::{
        Connection, SentPacket, State, ACK_DELAY_MAX, ACK_PACKET_THRESHOLD, MAX_TIMER_RETRANSMIT,
        RACK_DELAY_MICROS,
    },
};
use alloc::{vec, vec::Vec};
use minquic_codec::EncoderBuffer;
use minquic_core::{
    crypto::Engine,
    fnv1a,
    frame::{self, ack::AckBlock, Frame},
    packet::{self, PacketType, MAX_PACKET_SIZE},
    time::Timestamp,
    transport::Error,
};

/// Sending posture derived from the connection state
struct Plan {
    packet_type: PacketType,
    retransmit_possible: bool,
    stream_restricted: bool,
}

impl Connection {
    /// Produces the next datagram for this connection, if any is due
    pub(crate) fn prepare_packet(
        &mut self,
        engine: &mut dyn Engine,
        now: Timestamp,
    ) -> Option<Vec<u8>> {
        // a silent connection eventually dies
        if now.saturating_duration_since(self.latest_progress_time).as_micros() as u64
            > self.idle_timeout_micros()
        {
            self.disconnect();
            return None;
        }

        let plan = match self.state {
            State::ClientInit | State::ClientRenegotiate => Plan {
                packet_type: PacketType::ClientInitial,
                retransmit_possible: false,
                stream_restricted: true,
            },
            State::ClientInitSent | State::ClientInitResent => Plan {
                packet_type: PacketType::ClientInitial,
                retransmit_possible: true,
                stream_restricted: true,
            },
            State::ServerInit | State::ServerAlmostReady => Plan {
                packet_type: PacketType::ServerCleartext,
                retransmit_possible: false,
                stream_restricted: true,
            },
            State::ClientHandshakeStart | State::ClientHandshakeProgress => Plan {
                packet_type: PacketType::ClientCleartext,
                retransmit_possible: true,
                stream_restricted: true,
            },
            State::ClientAlmostReady => Plan {
                packet_type: PacketType::ClientCleartext,
                retransmit_possible: false,
                stream_restricted: true,
            },
            State::ClientReady | State::ServerReady => Plan {
                packet_type: PacketType::OneRttProtectedPhi0,
                retransmit_possible: true,
                stream_restricted: false,
            },
            State::Disconnecting => Plan {
                // the close travels under the strongest protection we have
                packet_type: if self.aead_encrypt.is_some() {
                    PacketType::OneRttProtectedPhi0
                } else if self.is_client {
                    PacketType::ClientCleartext
                } else {
                    PacketType::ServerCleartext
                },
                retransmit_possible: false,
                stream_restricted: true,
            },
            State::ServerSendHrr => {
                return self.send_hello_retry(engine, now);
            }
            State::ClientHrrReceived | State::Disconnected => return None,
        };

        if plan.retransmit_possible {
            if let Some(datagram) = self.retransmit_oldest_if_needed(now) {
                return Some(datagram);
            }
            if self.state == State::Disconnected {
                // loss recovery gave up
                return None;
            }
        }

        self.assemble_fresh_packet(&plan, now)
    }

    // === loss detection ===================================================

    /// Applies the SACK, RACK and timer rules from the sender side.
    /// The second flag reports a timer-based (RTO) decision.
    pub(crate) fn packet_is_lost(&self, sent: &SentPacket, now: Timestamp) -> (bool, bool) {
        // SACK: enough newer packets were acknowledged
        if self.highest_acknowledged > sent.sequence
            && self.highest_acknowledged - sent.sequence > 3
        {
            return (true, false);
        }

        // RACK: a newer packet has been acknowledged for a while
        if self.latest_time_acknowledged > sent.send_time {
            let delta = self
                .latest_time_acknowledged
                .saturating_duration_since(sent.send_time)
                .as_micros() as u64;
            if delta > RACK_DELAY_MICROS {
                return (true, false);
            }
            let since_last_ack = now
                .saturating_duration_since(self.latest_time_acknowledged)
                .as_micros() as u64;
            if since_last_ack + delta > RACK_DELAY_MICROS {
                return (true, false);
            }
        }

        // RTO with exponential backoff
        let timeout = now.saturating_duration_since(sent.send_time).as_micros() as u64;
        if timeout >= self.current_retransmit_timer() {
            return (true, true);
        }

        (false, false)
    }

    pub(crate) fn current_retransmit_timer(&self) -> u64 {
        if self.nb_retransmit == 0 {
            self.retransmit_timer
        } else {
            1_000_000u64 << (self.nb_retransmit - 1)
        }
    }

    /// Retransmits the oldest lost packet, if any. Packets are always
    /// retransmitted in order; pure-ACK packets are silently dropped from
    /// the queue.
    fn retransmit_oldest_if_needed(&mut self, now: Timestamp) -> Option<Vec<u8>> {
        while let Some(oldest) = self.retransmit.back() {
            let (lost, timer_based) = self.packet_is_lost(oldest, now);
            if !lost {
                return None;
            }

            let old = self.retransmit.pop_back().expect("non-empty queue");
            self.bytes_in_transit = self.bytes_in_transit.saturating_sub(old.on_wire_len as u64);

            let frames = retransmittable_frames(&old);
            if frames.is_empty() {
                // nothing in it worth repeating
                continue;
            }

            if timer_based {
                if self.nb_retransmit > MAX_TIMER_RETRANSMIT {
                    tracing::debug!(handle = self.handle.0, "retransmission limit exhausted");
                    self.disconnect();
                    return None;
                }
                self.nb_retransmit += 1;
                self.latest_retransmit_time = now;
            }

            tracing::trace!(
                handle = self.handle.0,
                sequence = old.sequence,
                timer_based,
                "retransmitting"
            );

            // the replacement keeps the original packet type and keys
            let checksum = old.packet_type.checksum_overhead();
            let mut storage = [0u8; MAX_PACKET_SIZE];
            let mut encoder = EncoderBuffer::new(&mut storage[..self.send_mtu]);
            self.encode_header(&mut encoder, old.packet_type, old.cnx_id).ok()?;
            let header_len = encoder.len();
            encoder.encode_slice(&frames).ok()?;

            self.append_ack_frame(&mut encoder, checksum, now);

            if old.packet_type == PacketType::ClientInitial {
                pad_to(&mut encoder, self.send_mtu - checksum);
            }

            self.congestion.notify(if timer_based {
                congestion::Event::Timeout {
                    lost_sequence: old.sequence,
                }
            } else {
                congestion::Event::Repeat {
                    lost_sequence: old.sequence,
                }
            });

            let datagram =
                self.protect_and_track(encoder.as_written(), header_len, old.packet_type, old.cnx_id, now, true);
            return datagram;
        }
        None
    }

    // === fresh packets ====================================================

    fn assemble_fresh_packet(&mut self, plan: &Plan, now: Timestamp) -> Option<Vec<u8>> {
        let checksum = plan.packet_type.checksum_overhead();
        let ready_stream = self.peek_ready_stream(plan.stream_restricted);
        let ack_wanted = self.is_ack_needed(now);
        let window_open = self.congestion.congestion_window() > self.bytes_in_transit;
        let disconnecting = self.state == State::Disconnecting;

        // cleartext packets only go out when they carry handshake data;
        // acknowledgements for those ride on the flights themselves
        if !plan.packet_type.is_protected() && ready_stream.is_none() && !disconnecting {
            return None;
        }

        if !disconnecting
            && !ack_wanted
            && !(window_open && (ready_stream.is_some() || self.should_send_max_data()))
        {
            return None;
        }

        let cnx_id = self.header_cnx_id(plan.packet_type);
        let mut storage = [0u8; MAX_PACKET_SIZE];
        // the buffer spans the datagram budget; every frame helper keeps
        // the checksum overhead out of what it writes
        let mut encoder = EncoderBuffer::new(&mut storage[..self.send_mtu]);
        self.encode_header(&mut encoder, plan.packet_type, cnx_id).ok()?;
        let header_len = encoder.len();

        self.append_ack_frame(&mut encoder, checksum, now);

        if disconnecting {
            let error = self.local_error.unwrap_or(Error::new(Error::NO_ERROR, ""));
            let close = Frame::ConnectionClose(frame::ConnectionClose {
                error_code: error.code,
                reason: error.reason.as_bytes(),
            });
            close.encode(&mut encoder).ok()?;
            let datagram =
                self.protect_and_track(encoder.as_written(), header_len, plan.packet_type, cnx_id, now, false);
            self.disconnect();
            return datagram;
        }

        let mut sent_stream_zero_tail = false;

        if window_open {
            self.append_flow_control_frames(&mut encoder, checksum);

            if let Some(stream_id) = ready_stream {
                sent_stream_zero_tail = self.append_stream_frame(&mut encoder, checksum, stream_id);
            }
        }

        if plan.packet_type == PacketType::ClientInitial {
            pad_to(&mut encoder, self.send_mtu - checksum);
        }

        if encoder.len() == header_len {
            return None;
        }

        // flushing the handshake stream advances the state machine
        if sent_stream_zero_tail {
            match self.state {
                State::ClientInit => self.state = State::ClientInitSent,
                State::ClientRenegotiate => self.state = State::ClientInitResent,
                State::ClientAlmostReady => self.state = State::ClientReady,
                State::ServerAlmostReady => self.state = State::ServerReady,
                _ => {}
            }
        }

        self.protect_and_track(encoder.as_written(), header_len, plan.packet_type, cnx_id, now, true)
    }

    /// Emits the hello-retry flight, then resets to a fresh server-init
    /// round so the retried client initial starts from scratch
    fn send_hello_retry(&mut self, engine: &mut dyn Engine, now: Timestamp) -> Option<Vec<u8>> {
        let cnx_id = Some(self.server_cnxid);
        let mut storage = [0u8; MAX_PACKET_SIZE];
        let mut encoder = EncoderBuffer::new(&mut storage[..self.send_mtu]);
        self.encode_header(&mut encoder, PacketType::ServerStatelessRetry, cnx_id)
            .ok()?;
        let header_len = encoder.len();

        let checksum = PacketType::ServerStatelessRetry.checksum_overhead();
        self.append_stream_frame(&mut encoder, checksum, 0);
        if encoder.len() == header_len {
            return None;
        }

        // the retry itself is never retransmitted; the client repeats its
        // initial if the retry is lost, which regenerates it
        let datagram = self.protect_and_track(
            encoder.as_written(),
            header_len,
            PacketType::ServerStatelessRetry,
            cnx_id,
            now,
            false,
        );

        self.reset_handshake_transport(engine, true);
        self.state = State::ServerInit;
        datagram
    }

    // === frame helpers ====================================================

    fn header_cnx_id(&self, packet_type: PacketType) -> Option<u64> {
        match packet_type {
            PacketType::ClientInitial => Some(self.initial_cnxid),
            PacketType::OneRttProtectedPhi0 | PacketType::OneRttProtectedPhi1 => {
                if self.remote_parameters.omit_connection_id {
                    None
                } else {
                    Some(self.server_cnxid)
                }
            }
            _ => Some(self.server_cnxid),
        }
    }

    fn encode_header(
        &self,
        encoder: &mut EncoderBuffer,
        packet_type: PacketType,
        cnx_id: Option<u64>,
    ) -> minquic_codec::EncoderResult {
        if packet_type.is_protected() {
            packet::encode_short_header(
                encoder,
                cnx_id,
                packet_type == PacketType::OneRttProtectedPhi1,
                self.send_sequence,
            )
        } else {
            packet::encode_long_header(
                encoder,
                packet_type,
                cnx_id.unwrap_or(0),
                self.send_sequence,
                self.version,
            )
        }
    }

    pub(crate) fn is_ack_needed(&self, now: Timestamp) -> bool {
        self.ack_needed
            && (self.unacked_count >= ACK_PACKET_THRESHOLD
                || now.saturating_duration_since(self.highest_ack_time) >= ACK_DELAY_MAX)
    }

    pub(crate) fn should_send_max_data(&self) -> bool {
        2 * self.data_received > self.maxdata_local
    }

    /// Piggy-backs an ACK on any packet with room for it
    fn append_ack_frame(&mut self, encoder: &mut EncoderBuffer, checksum: usize, now: Timestamp) {
        let Some(largest) = self.sack.largest() else {
            return;
        };

        let delay_micros = now
            .saturating_duration_since(self.time_stamp_largest_received)
            .as_micros() as u64;

        let mut ranges = self.sack.iter();
        let first = ranges.next().expect("non-empty sack");
        let mut blocks = Vec::new();
        let mut previous_start = first.start;
        for range in ranges {
            if blocks.len() >= 32 {
                break;
            }
            let missing = previous_start - range.end - 1;
            let Ok(gap) = u8::try_from(missing - 1) else {
                // too far back to describe; older ranges are dropped
                break;
            };
            blocks.push(AckBlock {
                gap,
                length: range.end - range.start,
            });
            previous_start = range.start;
        }

        let ack = frame::Ack {
            largest,
            delay_micros,
            first_block: first.end - first.start,
            blocks,
        };

        let rollback = encoder.len();
        let budget = encoder.remaining_capacity().saturating_sub(checksum);
        let mut scratch = [0u8; MAX_PACKET_SIZE];
        let mut probe = EncoderBuffer::new(&mut scratch[..budget]);
        if ack.encode(&mut probe).is_err() {
            return;
        }
        match encoder.encode_slice(probe.as_written()) {
            Ok(()) => {
                self.ack_needed = false;
                self.unacked_count = 0;
                self.highest_ack_sent = largest;
            }
            Err(_) => encoder.truncate(rollback),
        }
    }

    /// MAX_DATA and MAX_STREAM_DATA when the consumed half of a window
    /// justifies raising it. The local limit moves together with the
    /// announcement so the trigger disarms.
    fn append_flow_control_frames(&mut self, encoder: &mut EncoderBuffer, checksum: usize) {
        let budget = |encoder: &EncoderBuffer| encoder.remaining_capacity().saturating_sub(checksum);

        if self.should_send_max_data() && budget(encoder) >= 9 {
            let maximum_data = 2 * self.data_received;
            let frame = frame::MaxData { maximum_data };
            if frame.encode(encoder).is_ok() {
                self.maxdata_local = maximum_data;
            }
        }

        let mut updates: Vec<(u32, u64)> = Vec::new();
        for (stream_id, stream) in &self.streams {
            if stream.reset_received || stream.fin_received {
                continue;
            }
            if 2 * stream.highest_received > stream.maxdata_local {
                updates.push((*stream_id, 2 * stream.highest_received));
            }
        }
        for (stream_id, maximum_stream_data) in updates {
            if budget(encoder) < 13 {
                break;
            }
            let frame = frame::MaxStreamData {
                stream_id,
                maximum_stream_data,
            };
            if frame.encode(encoder).is_ok() {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.maxdata_local = maximum_stream_data;
                }
            }
        }
    }

    /// Picks the stream the sender should service: stream 0 while any
    /// handshake data is pending, then the application streams in
    /// round-robin order
    fn peek_ready_stream(&self, restricted: bool) -> Option<u32> {
        if self.stream_zero.is_ready_to_send() {
            return Some(0);
        }
        if restricted {
            return None;
        }

        let connection_blocked = self.data_sent >= self.maxdata_remote;
        let ready = |stream: &crate::stream::Stream| {
            stream.is_ready_to_send()
                && (!connection_blocked || stream.reset_requested || stream.pending_send() == 0)
        };

        let cursor = self.next_poll_stream;
        self.streams
            .range(cursor.saturating_add(1)..)
            .find(|(_, stream)| ready(stream))
            .or_else(|| self.streams.range(..).find(|(_, stream)| ready(stream)))
            .map(|(stream_id, _)| *stream_id)
    }

    /// Packs one STREAM or RST_STREAM frame. Returns true when this was
    /// stream 0 and its queue is now fully flushed.
    fn append_stream_frame(
        &mut self,
        encoder: &mut EncoderBuffer,
        checksum: usize,
        stream_id: u32,
    ) -> bool {
        if stream_id != 0 {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                return false;
            };

            if stream.reset_requested && !stream.reset_sent {
                let frame = frame::ResetStream {
                    stream_id,
                    error_code: stream.local_error.unwrap_or(Error::CANCELLED),
                    final_offset: stream.sent_offset,
                };
                if encoder.remaining_capacity() >= checksum + 17 && frame.encode(encoder).is_ok() {
                    stream.reset_sent = true;
                }
                return false;
            }
        }

        // length always travels explicitly: padding may follow the frame,
        // and an implicit length would swallow it as stream data
        let (sent_offset, stream_allowance) = if stream_id == 0 {
            (self.stream_zero.sent_offset, u64::MAX)
        } else {
            let stream = &self.streams[&stream_id];
            (
                stream.sent_offset,
                stream.maxdata_remote.saturating_sub(stream.sent_offset),
            )
        };

        let connection_allowance = if stream_id == 0 {
            u64::MAX
        } else {
            self.maxdata_remote.saturating_sub(self.data_sent)
        };

        let overhead = 1 + 4 + offset_width(sent_offset) + 2;
        let capacity = encoder
            .remaining_capacity()
            .saturating_sub(checksum + overhead);
        let max_len = (capacity as u64)
            .min(stream_allowance)
            .min(connection_allowance) as usize;

        let stream = if stream_id == 0 {
            &mut self.stream_zero
        } else {
            self.streams.get_mut(&stream_id).expect("stream exists")
        };

        if max_len == 0 && stream.pending_send() > 0 {
            return false;
        }

        let (offset, data, fin) = stream.next_send(max_len);
        if data.is_empty() && !fin {
            return false;
        }

        let frame = frame::Stream {
            stream_id,
            offset,
            fin,
            explicit_length: true,
            data: &data,
        };
        let rollback = encoder.len();
        if frame.encode(encoder).is_err() {
            encoder.truncate(rollback);
            return false;
        }

        if stream_id != 0 {
            self.data_sent += data.len() as u64;
            self.next_poll_stream = stream_id;
            false
        } else {
            self.stream_zero.pending_send() == 0
        }
    }

    fn protect_and_track(
        &mut self,
        plaintext: &[u8],
        header_len: usize,
        packet_type: PacketType,
        cnx_id: Option<u64>,
        now: Timestamp,
        track: bool,
    ) -> Option<Vec<u8>> {
        let sequence = self.send_sequence;

        let datagram = if packet_type.is_protected() {
            let key = self.aead_encrypt.as_ref()?;
            let mut out = vec![0u8; plaintext.len() + minquic_core::crypto::AEAD_TAG_LEN];
            out[..header_len].copy_from_slice(&plaintext[..header_len]);
            let sealed_len = key.seal(
                &mut out[header_len..],
                &plaintext[header_len..],
                sequence,
                &plaintext[..header_len],
            );
            out.truncate(header_len + sealed_len);
            out
        } else {
            let mut out = vec![0u8; plaintext.len() + fnv1a::CHECKSUM_LEN];
            out[..plaintext.len()].copy_from_slice(plaintext);
            let protected_len = fnv1a::protect(&mut out, plaintext.len())?;
            out.truncate(protected_len);
            out
        };

        self.send_sequence += 1;

        if track {
            self.bytes_in_transit += datagram.len() as u64;
            self.retransmit.push_front(SentPacket {
                sequence,
                send_time: now,
                bytes: plaintext.to_vec(),
                frames_offset: header_len,
                packet_type,
                cnx_id,
                on_wire_len: datagram.len(),
            });
        }

        Some(datagram)
    }

    // === wake time ========================================================

    /// Recomputes when this connection next needs attention, per the ACK
    /// delay, RACK and RTO deadlines and the idle timeout
    pub(crate) fn set_next_wake_time(&mut self, now: Timestamp) {
        use core::time::Duration;

        if self.state == State::Disconnected {
            self.next_wake_time = self
                .latest_progress_time
                .checked_add(Duration::from_secs(86400))
                .unwrap_or(self.latest_progress_time);
            return;
        }

        let mut next_time = self.latest_progress_time
            + Duration::from_micros(self.idle_timeout_micros());

        let mut blocked = !matches!(self.state, State::Disconnecting | State::ServerSendHrr);

        if blocked {
            if let Some(oldest) = self.retransmit.back() {
                if self.packet_is_lost(oldest, now).0 {
                    blocked = false;
                }
            }
        }
        // pure acknowledgements only exist under 1-RTT protection
        if blocked && self.state.is_ready() && self.is_ack_needed(now) {
            blocked = false;
        }
        if blocked && self.congestion.congestion_window() > self.bytes_in_transit {
            let restricted = !self.state.is_ready();
            if self.should_send_max_data() && self.state.is_ready() {
                blocked = false;
            } else if self.peek_ready_stream(restricted).is_some() {
                blocked = false;
            }
        }

        if !blocked {
            self.next_wake_time = now;
            return;
        }

        if self.ack_needed && self.state.is_ready() {
            next_time = next_time.min(self.highest_ack_time + ACK_DELAY_MAX);
        }

        if let Some(oldest) = self.retransmit.back() {
            if self.latest_time_acknowledged > oldest.send_time {
                next_time =
                    next_time.min(oldest.send_time + Duration::from_micros(RACK_DELAY_MICROS));
            }
            next_time = next_time
                .min(oldest.send_time + Duration::from_micros(self.current_retransmit_timer()));
        }

        self.next_wake_time = next_time;
    }
}

/// Concatenated non-pure-ACK frames of a stored packet
fn retransmittable_frames(sent: &SentPacket) -> Vec<u8> {
    let mut frames = Vec::new();
    let mut offset = sent.frames_offset;
    while offset < sent.bytes.len() {
        let buffer = minquic_codec::DecoderBuffer::new(&sent.bytes[offset..]);
        match frame::skip(buffer) {
            Ok((consumed, pure_ack)) => {
                if !pure_ack {
                    frames.extend_from_slice(&sent.bytes[offset..offset + consumed]);
                }
                offset += consumed;
            }
            Err(_) => break,
        }
    }
    frames
}

fn pad_to(encoder: &mut EncoderBuffer, target: usize) {
    while encoder.len() < target {
        if encoder.encode_u8(0).is_err() {
            break;
        }
    }
}

fn offset_width(offset: u64) -> usize {
    match offset {
        0 => 0,
        1..=0xffff => 2,
        0x1_0000..=0xffff_ffff => 4,
        _ => 8,
    }
}
