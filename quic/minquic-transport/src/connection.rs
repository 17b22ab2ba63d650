// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-connection state machine
//!
//! A connection owns its streams, acknowledgement state, retransmission
//! queue, keys and flow control counters. The receive half lives here;
//! packet assembly and loss recovery live in `sender.rs`, and the
//! handshake driver in `tls.rs`.

use crate::{
    congestion,
    error::LocalError,
    limits::Limits,
    stream::{CallbackEvent, Stream},
    tls::TlsAdapter,
};
use minquic_core::{
    crypto::{self, Engine, Key},
    fnv1a,
    frame::{self, Frame},
    packet::{self, Header, PacketType},
    sack::SackList,
    time::Timestamp,
    transport::{Error, TransportParameters},
};
use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    vec,
    vec::Vec,
};
use core::{net::SocketAddr, time::Duration};
use smallvec::SmallVec;
use subtle::ConstantTimeEq;

/// Identifies a connection within its endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionHandle(pub(crate) u64);

/// Time an acknowledgement may be delayed
pub(crate) const ACK_DELAY_MAX: Duration = Duration::from_millis(10);

/// Packets received without acknowledging before an immediate ACK is due
pub(crate) const ACK_PACKET_THRESHOLD: u32 = 2;

/// Reordering delay tolerated before RACK declares a loss
pub(crate) const RACK_DELAY_MICROS: u64 = 10_000;

/// Timer-based retransmissions tolerated before giving up
pub(crate) const MAX_TIMER_RETRANSMIT: u32 = 4;

pub(crate) const INITIAL_RTT_MICROS: u64 = 250_000;
pub(crate) const INITIAL_RETRANSMIT_TIMER_MICROS: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    ClientInit,
    ClientInitSent,
    ClientRenegotiate,
    ClientHrrReceived,
    ClientInitResent,
    ServerInit,
    ClientHandshakeStart,
    ClientHandshakeProgress,
    ClientAlmostReady,
    ClientReady,
    ServerAlmostReady,
    ServerReady,
    Disconnecting,
    Disconnected,
    ServerSendHrr,
}

impl State {
    pub fn is_ready(self) -> bool {
        matches!(self, State::ClientReady | State::ServerReady)
    }

    pub fn is_closed(self) -> bool {
        matches!(self, State::Disconnecting | State::Disconnected)
    }
}

/// Stream-data callback: connection handle, stream id, bytes, event
pub type StreamDataCallback = Box<dyn FnMut(ConnectionHandle, u32, &[u8], CallbackEvent)>;

/// A sent packet, kept in cleartext until acknowledged or abandoned
#[derive(Debug)]
pub(crate) struct SentPacket {
    pub sequence: u64,
    pub send_time: Timestamp,
    /// Cleartext image, header included
    pub bytes: Vec<u8>,
    /// Offset of the first frame inside `bytes`
    pub frames_offset: usize,
    pub packet_type: PacketType,
    pub cnx_id: Option<u64>,
    /// Protected length, the amount counted in flight
    pub on_wire_len: usize,
}

pub struct Connection {
    pub(crate) handle: ConnectionHandle,

    // identity
    pub(crate) initial_cnxid: u64,
    pub(crate) server_cnxid: u64,
    pub(crate) extra_cnxids: SmallVec<[u64; 4]>,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) proposed_version: u32,
    pub(crate) version: u32,
    pub(crate) is_client: bool,
    pub(crate) state: State,

    // cryptography
    pub(crate) tls: TlsAdapter,
    pub(crate) aead_encrypt: Option<Box<dyn Key>>,
    pub(crate) aead_decrypt: Option<Box<dyn Key>>,
    /// Opens packets we ourselves sealed; used to discard packets echoed
    /// back at us (e.g. by a reflector) instead of treating them as resets
    pub(crate) aead_de_encrypt: Option<Box<dyn Key>>,
    pub(crate) reset_secret: [u8; crypto::RESET_SECRET_LEN],

    // streams
    pub(crate) stream_zero: Stream,
    pub(crate) streams: BTreeMap<u32, Stream>,
    pub(crate) next_poll_stream: u32,

    // reliability; front of the queue is the newest packet
    pub(crate) retransmit: VecDeque<SentPacket>,
    pub(crate) send_sequence: u64,
    pub(crate) highest_acknowledged: u64,
    pub(crate) latest_time_acknowledged: Timestamp,
    pub(crate) nb_retransmit: u32,
    pub(crate) latest_retransmit_time: Timestamp,
    pub(crate) bytes_in_transit: u64,

    // acknowledgement state
    pub(crate) sack: SackList,
    pub(crate) ack_needed: bool,
    pub(crate) unacked_count: u32,
    pub(crate) highest_ack_sent: u64,
    /// Receipt time of the packet that armed `ack_needed`
    pub(crate) highest_ack_time: Timestamp,
    pub(crate) time_stamp_largest_received: Timestamp,

    // flow control
    pub(crate) maxdata_local: u64,
    pub(crate) maxdata_remote: u64,
    pub(crate) data_received: u64,
    pub(crate) data_sent: u64,
    pub(crate) max_stream_id_local: u32,
    pub(crate) max_stream_id_remote: u32,

    // timing
    pub(crate) start_time: Timestamp,
    pub(crate) next_wake_time: Timestamp,
    pub(crate) latest_progress_time: Timestamp,
    pub(crate) smoothed_rtt: u64,
    pub(crate) rtt_variant: u64,
    pub(crate) rtt_min: u64,
    pub(crate) retransmit_timer: u64,

    // congestion control
    pub(crate) congestion: Box<dyn congestion::Controller>,

    // transport parameters
    pub(crate) local_parameters: TransportParameters,
    pub(crate) remote_parameters: TransportParameters,

    // closing
    pub(crate) local_error: Option<Error>,
    pub(crate) remote_error: Option<u32>,

    pub(crate) send_mtu: usize,
    pub(crate) callback: Option<StreamDataCallback>,
    /// Connection ids announced by the peer, waiting for endpoint
    /// registration
    pub(crate) pending_cnx_ids: Vec<u64>,
}

fn initial_mtu(addr: &SocketAddr) -> usize {
    if addr.is_ipv4() {
        packet::INITIAL_MTU_IPV4
    } else {
        packet::INITIAL_MTU_IPV6
    }
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handle: ConnectionHandle,
        engine: &mut dyn Engine,
        limits: Limits,
        congestion_factory: congestion::Factory,
        peer_addr: SocketAddr,
        start_time: Timestamp,
        is_client: bool,
        cnx_id: u64,
        preferred_version: u32,
        session_config: crypto::SessionConfig,
        callback: Option<StreamDataCallback>,
    ) -> Self {
        let mut local_parameters = limits.to_parameters();
        let remote_parameters = TransportParameters::default();

        let (initial_cnxid, server_cnxid, reset_secret, proposed_version, state) = if is_client {
            let initial_cnxid = if cnx_id != 0 { cnx_id } else { engine.random_u64() };
            // the real value arrives with the server's transport
            // parameters; random until then so forged resets cannot match
            let mut reset_secret = [0u8; crypto::RESET_SECRET_LEN];
            engine.random_bytes(&mut reset_secret);
            local_parameters.omit_connection_id = true;
            let version = if preferred_version != 0 {
                preferred_version
            } else {
                minquic_core::SUPPORTED_VERSIONS[0]
            };
            (initial_cnxid, 0, reset_secret, version, State::ClientInit)
        } else {
            let server_cnxid = engine.random_u64();
            local_parameters.stateless_reset_token = Some(engine.reset_token(server_cnxid));
            (
                cnx_id,
                server_cnxid,
                engine.reset_token(server_cnxid),
                preferred_version,
                State::ServerInit,
            )
        };

        let send_sequence = u64::from(engine.random_u32().max(1));

        let mode = if is_client {
            crypto::Mode::Client
        } else {
            crypto::Mode::Server
        };
        let mut tls = TlsAdapter::new(engine, mode, session_config, &local_parameters);
        let mut stream_zero = Stream::new(0, u64::MAX, u64::MAX);
        if is_client {
            // produce the first handshake flight onto stream 0
            let _ = tls.start(&mut stream_zero);
        }

        Self {
            handle,
            initial_cnxid,
            server_cnxid,
            extra_cnxids: SmallVec::new(),
            peer_addr,
            proposed_version,
            version: proposed_version,
            is_client,
            state,
            tls,
            aead_encrypt: None,
            aead_decrypt: None,
            aead_de_encrypt: None,
            reset_secret,
            stream_zero,
            streams: BTreeMap::new(),
            next_poll_stream: 0,
            retransmit: VecDeque::new(),
            send_sequence,
            highest_acknowledged: send_sequence - 1,
            latest_time_acknowledged: start_time,
            nb_retransmit: 0,
            latest_retransmit_time: start_time,
            bytes_in_transit: 0,
            sack: SackList::new(),
            ack_needed: false,
            unacked_count: 0,
            highest_ack_sent: 0,
            highest_ack_time: start_time,
            time_stamp_largest_received: start_time,
            maxdata_local: local_parameters.initial_max_data_bytes(),
            maxdata_remote: remote_parameters.initial_max_data_bytes(),
            data_received: 0,
            data_sent: 0,
            max_stream_id_local: local_parameters.initial_max_stream_id,
            max_stream_id_remote: remote_parameters.initial_max_stream_id,
            start_time,
            next_wake_time: start_time,
            latest_progress_time: start_time,
            smoothed_rtt: INITIAL_RTT_MICROS,
            rtt_variant: 0,
            rtt_min: 0,
            retransmit_timer: INITIAL_RETRANSMIT_TIMER_MICROS,
            congestion: congestion_factory(),
            local_parameters,
            remote_parameters,
            local_error: None,
            remote_error: None,
            send_mtu: initial_mtu(&peer_addr),
            callback,
            pending_cnx_ids: Vec::new(),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn initial_cnxid(&self) -> u64 {
        self.initial_cnxid
    }

    pub fn server_cnxid(&self) -> u64 {
        self.server_cnxid
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    pub fn next_wake_time(&self) -> Timestamp {
        self.next_wake_time
    }

    pub fn negotiated_version(&self) -> u32 {
        self.version
    }

    /// Error code received in a CONNECTION_CLOSE, if the peer closed
    pub fn remote_error(&self) -> Option<u32> {
        self.remote_error
    }

    /// Error this endpoint reported (or will report) to the peer
    pub fn local_error(&self) -> Option<Error> {
        self.local_error
    }

    pub fn negotiated_protocol(&self) -> Option<&str> {
        self.tls.negotiated_protocol()
    }

    pub fn server_name(&self) -> Option<&str> {
        self.tls.server_name()
    }

    pub fn set_callback(&mut self, callback: StreamDataCallback) {
        self.callback = Some(callback);
    }

    /// Queues application data on a stream
    pub fn add_to_stream(&mut self, stream_id: u32, data: &[u8], fin: bool) -> Result<(), LocalError> {
        if stream_id == 0 {
            return Err(LocalError::StreamZeroReserved);
        }
        if self.state == State::Disconnected {
            return Err(LocalError::Disconnected);
        }
        if stream_id > self.max_stream_id_remote {
            return Err(LocalError::InvalidStreamId);
        }

        let stream = self.get_or_create_stream_unchecked(stream_id);
        if stream.fin_requested || stream.reset_requested || stream.reset_sent {
            return Err(LocalError::StreamAlreadyClosed);
        }
        stream.enqueue(data, fin);
        Ok(())
    }

    /// Requests an abrupt close of a stream's sending side
    pub fn reset_stream(&mut self, stream_id: u32) -> Result<(), LocalError> {
        if stream_id == 0 {
            return Err(LocalError::StreamZeroReserved);
        }
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Err(LocalError::InvalidStreamId);
        };
        if stream.fin_sent {
            return Err(LocalError::StreamAlreadyClosed);
        }
        if !stream.reset_requested {
            stream.local_error = Some(Error::CANCELLED);
            stream.reset_requested = true;
        }
        Ok(())
    }

    /// Starts an orderly close; a CONNECTION_CLOSE goes out on the next
    /// prepared packet
    pub fn close(&mut self) -> Result<(), LocalError> {
        if self.state.is_ready() {
            self.local_error = Some(Error::new(Error::NO_ERROR, ""));
            self.state = State::Disconnecting;
            Ok(())
        } else {
            Err(LocalError::Disconnected)
        }
    }

    /// True when no in-flight packet still carries retransmittable frames
    pub fn is_backlog_empty(&self) -> bool {
        for sent in &self.retransmit {
            let mut offset = sent.frames_offset;
            while offset < sent.bytes.len() {
                let buffer = minquic_codec::DecoderBuffer::new(&sent.bytes[offset..]);
                match frame::skip(buffer) {
                    Ok((consumed, pure_ack)) => {
                        if !pure_ack {
                            return false;
                        }
                        offset += consumed;
                    }
                    Err(_) => break,
                }
            }
        }
        true
    }

    pub(crate) fn get_or_create_stream_unchecked(&mut self, stream_id: u32) -> &mut Stream {
        let maxdata_local = u64::from(self.local_parameters.initial_max_stream_data);
        let maxdata_remote = u64::from(self.remote_parameters.initial_max_stream_data);
        self.streams
            .entry(stream_id)
            .or_insert_with(|| Stream::new(stream_id, maxdata_local, maxdata_remote))
    }

    pub(crate) fn deliver(&mut self, stream_id: u32, bytes: &[u8], event: CallbackEvent) {
        let handle = self.handle;
        if let Some(callback) = self.callback.as_mut() {
            callback(handle, stream_id, bytes, event);
        }
    }

    pub(crate) fn disconnect(&mut self) {
        if self.state != State::Disconnected {
            tracing::debug!(handle = self.handle.0, "connection disconnected");
            self.state = State::Disconnected;
            self.deliver(0, &[], CallbackEvent::Close);
        }
    }

    /// Records a peer-visible protocol failure and heads for
    /// CONNECTION_CLOSE emission
    pub(crate) fn protocol_error(&mut self, error: Error) {
        if !self.state.is_closed() {
            tracing::debug!(handle = self.handle.0, %error, "protocol error");
            self.local_error = Some(error);
            self.state = State::Disconnecting;
        }
    }

    // === receive path =====================================================

    /// Applies a verified datagram to the connection. Integrity failures
    /// and duplicates are silently dropped.
    pub(crate) fn incoming(
        &mut self,
        engine: &mut dyn Engine,
        datagram: &[u8],
        header: Header,
        now: Timestamp,
    ) {
        match header.packet_type {
            PacketType::VersionNegotiation => {
                self.handle_version_negotiation(engine, datagram, &header, now);
            }
            PacketType::ClientInitial
            | PacketType::ServerStatelessRetry
            | PacketType::ServerCleartext
            | PacketType::ClientCleartext => {
                self.incoming_cleartext(datagram, &header, now);
            }
            PacketType::OneRttProtectedPhi0 | PacketType::OneRttProtectedPhi1 => {
                self.incoming_protected(datagram, &header, now);
            }
            PacketType::PublicReset => {
                self.handle_public_reset(datagram, &header);
            }
            PacketType::ZeroRtt => {
                // not supported; silently discarded
            }
        }
    }

    fn incoming_cleartext(&mut self, datagram: &[u8], header: &Header, now: Timestamp) {
        let Some(verified_len) = fnv1a::verify(datagram) else {
            return;
        };
        let sequence = packet::number::expand(
            header.packet_number,
            header.packet_number_bits,
            self.sack.largest().unwrap_or(0),
        );
        if self.sack.contains(sequence) {
            return;
        }

        // client side state advance on first server cleartext
        if matches!(
            self.state,
            State::ClientInit | State::ClientInitSent | State::ClientInitResent
        ) {
            match header.packet_type {
                PacketType::ServerCleartext => {
                    // the server has chosen its connection id
                    self.server_cnxid = header.cnx_id.unwrap_or(0);
                    self.state = State::ClientHandshakeStart;
                }
                PacketType::ServerStatelessRetry => {
                    self.state = State::ClientHrrReceived;
                }
                _ => {}
            }
        }

        let payload = &datagram[header.header_len..verified_len];
        self.apply_frames(payload, sequence, now);
    }

    fn incoming_protected(&mut self, datagram: &[u8], header: &Header, now: Timestamp) {
        let sequence = packet::number::expand(
            header.packet_number,
            header.packet_number_bits,
            self.sack.largest().unwrap_or(0),
        );

        let sealed = &datagram[header.header_len..];
        let aad = &datagram[..header.header_len];
        let mut plain = vec![0u8; sealed.len()];

        let opened = self
            .aead_decrypt
            .as_ref()
            .and_then(|key| key.open(&mut plain, sealed, sequence, aad));

        let Some(plain_len) = opened else {
            self.check_undecryptable(datagram, sealed, aad, sequence);
            return;
        };

        if self.sack.contains(sequence) {
            return;
        }

        let payload = plain[..plain_len].to_vec();
        self.apply_frames(&payload, sequence, now);
    }

    /// A short-header packet that did not authenticate: either our own
    /// packet echoed back, a stateless reset, or garbage
    fn check_undecryptable(
        &mut self,
        datagram: &[u8],
        sealed: &[u8],
        aad: &[u8],
        sequence: u64,
    ) {
        if let Some(key) = self.aead_de_encrypt.as_ref() {
            let mut scratch = vec![0u8; sealed.len()];
            if key.open(&mut scratch, sealed, sequence, aad).is_some() {
                // echoed back at us; not a reset
                return;
            }
        }

        if datagram.len() >= crypto::RESET_SECRET_LEN {
            let tail = &datagram[datagram.len() - crypto::RESET_SECRET_LEN..];
            if bool::from(tail.ct_eq(&self.reset_secret)) {
                tracing::debug!(handle = self.handle.0, "stateless reset accepted");
                self.disconnect();
            }
        }
    }

    fn handle_public_reset(&mut self, datagram: &[u8], header: &Header) {
        let Some(verified_len) = fnv1a::verify(datagram) else {
            return;
        };
        let payload = &datagram[header.header_len..verified_len];
        if payload.len() >= crypto::RESET_SECRET_LEN {
            let tail = &payload[..crypto::RESET_SECRET_LEN];
            if bool::from(tail.ct_eq(&self.reset_secret)) {
                self.disconnect();
            }
        }
    }

    fn handle_version_negotiation(
        &mut self,
        engine: &mut dyn Engine,
        datagram: &[u8],
        header: &Header,
        _now: Timestamp,
    ) {
        if !matches!(self.state, State::ClientInit | State::ClientInitSent) {
            return;
        }
        let Some(verified_len) = fnv1a::verify(datagram) else {
            return;
        };

        let mut offered = Vec::new();
        let mut buffer = minquic_codec::DecoderBuffer::new(&datagram[header.header_len..verified_len]);
        while let Ok((version, rest)) = buffer.decode_u32() {
            offered.push(version);
            buffer = rest;
        }

        // a list containing the version we proposed is spoofed or stale
        if offered.contains(&self.proposed_version) {
            return;
        }

        let Some(version) = offered
            .iter()
            .find(|version| minquic_core::is_supported_version(**version))
        else {
            return;
        };

        tracing::debug!(handle = self.handle.0, version, "renegotiating version");
        self.version = *version;
        self.state = State::ClientRenegotiate;
        self.reset_handshake_transport(engine, true);
    }

    /// Drops every queued retransmission and restarts stream 0, as both
    /// version renegotiation and the HRR round trip require
    pub(crate) fn reset_handshake_transport(&mut self, engine: &mut dyn Engine, new_session: bool) {
        self.retransmit.clear();
        self.bytes_in_transit = 0;
        self.stream_zero.reset_transfer_state();
        if new_session {
            self.tls.restart(engine, &self.local_parameters);
            let _ = self.tls.start(&mut self.stream_zero);
        }
    }

    fn apply_frames(&mut self, payload: &[u8], sequence: u64, now: Timestamp) {
        match self.process_frames(payload, now) {
            Ok(retransmittable) => {
                let previous_largest = self.sack.largest();
                self.sack.insert(sequence);
                if previous_largest.map_or(true, |largest| sequence > largest) {
                    self.time_stamp_largest_received = now;
                }
                if retransmittable {
                    if !self.ack_needed {
                        self.ack_needed = true;
                        self.highest_ack_time = now;
                    }
                    self.unacked_count += 1;
                }
                self.latest_progress_time = now;
            }
            Err(error) => self.protocol_error(error),
        }
    }

    /// Interprets every frame in a packet. Returns whether any frame was
    /// retransmittable.
    fn process_frames(&mut self, payload: &[u8], now: Timestamp) -> Result<bool, Error> {
        let mut buffer = minquic_codec::DecoderBuffer::new(payload);
        let mut retransmittable = false;

        while !buffer.is_empty() {
            let (frame, rest) = match Frame::decode(buffer) {
                Ok(decoded) => decoded,
                Err(minquic_codec::DecoderError::UnexpectedEof) => {
                    // a recognised frame type that ran out of bytes
                    let tag = buffer.peek_byte(0).unwrap_or(0);
                    return Err(Error::frame_error(tag));
                }
                Err(error) => return Err(Error::from(error)),
            };
            retransmittable |= !frame.is_pure_ack();

            match frame {
                Frame::Padding(_) => {}
                Frame::Ping(_) => {}
                Frame::Ack(ack) => self.process_ack(&ack, now),
                Frame::Stream(stream) => self.handle_stream_frame(&stream, now)?,
                Frame::MaxData(frame) => {
                    self.maxdata_remote = self.maxdata_remote.max(frame.maximum_data);
                }
                Frame::MaxStreamData(frame) => {
                    if frame.stream_id == 0 {
                        return Err(Error::new(
                            Error::PROTOCOL_VIOLATION,
                            "flow control on stream 0",
                        ));
                    }
                    if frame.stream_id <= self.max_stream_id_local.max(self.max_stream_id_remote) {
                        let stream = self.get_or_create_stream_unchecked(frame.stream_id);
                        stream.maxdata_remote = stream.maxdata_remote.max(frame.maximum_stream_data);
                    }
                }
                Frame::MaxStreamId(frame) => {
                    self.max_stream_id_remote =
                        self.max_stream_id_remote.max(frame.maximum_stream_id);
                }
                Frame::ResetStream(frame) => self.handle_reset_stream(&frame)?,
                Frame::StopSending(frame) => self.handle_stop_sending(&frame)?,
                Frame::ConnectionClose(frame) => {
                    tracing::debug!(
                        handle = self.handle.0,
                        error = frame.error_code,
                        "peer closed the connection"
                    );
                    self.remote_error = Some(frame.error_code);
                    self.disconnect();
                }
                Frame::NewConnectionId(frame) => {
                    self.pending_cnx_ids.push(frame.cnx_id);
                }
                Frame::Blocked(_) | Frame::StreamBlocked(_) | Frame::StreamIdNeeded(_) => {
                    // informational only
                }
            }

            buffer = rest;
        }

        Ok(retransmittable)
    }

    fn handle_stream_frame(
        &mut self,
        frame: &frame::Stream<'_>,
        now: Timestamp,
    ) -> Result<(), Error> {
        if frame.stream_id == 0 {
            self.stream_zero
                .receive(frame.offset, frame.data, frame.fin)?;
            return self.drive_tls(now);
        }

        if frame.stream_id > self.max_stream_id_local {
            return Err(Error::new(Error::STREAM_ID_ERROR, "stream id above limit"));
        }

        let stream = self.get_or_create_stream_unchecked(frame.stream_id);
        if stream.reset_received {
            return Ok(());
        }
        let newly_received = stream.receive(frame.offset, frame.data, frame.fin)?;

        self.data_received += newly_received;
        if self.data_received > self.maxdata_local {
            return Err(Error::new(
                Error::FLOW_CONTROL_ERROR,
                "connection flow control limit exceeded",
            ));
        }

        let stream_id = frame.stream_id;
        while let Some((bytes, fin)) = self
            .streams
            .get_mut(&stream_id)
            .and_then(|stream| stream.deliverable())
        {
            if !bytes.is_empty() {
                self.deliver(stream_id, &bytes, CallbackEvent::Data);
            }
            if fin {
                self.deliver(stream_id, &[], CallbackEvent::Fin);
            }
        }

        Ok(())
    }

    fn handle_reset_stream(&mut self, frame: &frame::ResetStream) -> Result<(), Error> {
        if frame.stream_id == 0 {
            return Err(Error::new(Error::PROTOCOL_VIOLATION, "reset of stream 0"));
        }
        if frame.stream_id > self.max_stream_id_local {
            return Err(Error::new(Error::STREAM_ID_ERROR, "stream id above limit"));
        }

        let stream = self.get_or_create_stream_unchecked(frame.stream_id);
        if stream.fin_received && stream.fin_offset != Some(frame.final_offset) {
            return Err(Error::new(
                Error::FINAL_OFFSET_ERROR,
                "reset contradicts the final offset",
            ));
        }
        if frame.final_offset < stream.highest_received {
            return Err(Error::new(
                Error::FINAL_OFFSET_ERROR,
                "reset below received data",
            ));
        }

        let newly_received = frame.final_offset - stream.highest_received;
        stream.highest_received = frame.final_offset;
        stream.remote_error = Some(frame.error_code);
        let already_signalled = stream.reset_received || stream.reset_signalled;
        stream.reset_received = true;
        stream.reset_signalled = true;

        self.data_received += newly_received;
        if self.data_received > self.maxdata_local {
            return Err(Error::new(
                Error::FLOW_CONTROL_ERROR,
                "connection flow control limit exceeded",
            ));
        }

        if !already_signalled {
            self.deliver(frame.stream_id, &[], CallbackEvent::Reset);
        }
        Ok(())
    }

    fn handle_stop_sending(&mut self, frame: &frame::StopSending) -> Result<(), Error> {
        if frame.stream_id == 0 {
            return Err(Error::new(
                Error::PROTOCOL_VIOLATION,
                "stop sending on stream 0",
            ));
        }
        if frame.stream_id > self.max_stream_id_local {
            return Err(Error::new(Error::STREAM_ID_ERROR, "stream id above limit"));
        }

        let stream = self.get_or_create_stream_unchecked(frame.stream_id);
        if !stream.reset_requested && !stream.fin_sent {
            stream.local_error = Some(frame.error_code);
            stream.reset_requested = true;
        }
        Ok(())
    }

    // === acknowledgement processing =======================================

    fn process_ack(&mut self, ack: &frame::Ack, now: Timestamp) {
        let ranges: Vec<(u64, u64)> = ack.ranges().collect();
        let covered =
            |sequence: u64| ranges.iter().any(|(start, end)| (*start..=*end).contains(&sequence));

        let mut kept = VecDeque::with_capacity(self.retransmit.len());
        let mut acked_bytes = 0u64;
        let mut rtt_sample = None;

        while let Some(sent) = self.retransmit.pop_front() {
            if !covered(sent.sequence) {
                kept.push_back(sent);
                continue;
            }

            acked_bytes += sent.on_wire_len as u64;
            self.bytes_in_transit = self.bytes_in_transit.saturating_sub(sent.on_wire_len as u64);
            self.highest_acknowledged = self.highest_acknowledged.max(sent.sequence);
            self.latest_time_acknowledged = self.latest_time_acknowledged.max(sent.send_time);
            if sent.sequence == ack.largest {
                rtt_sample = Some(now.saturating_duration_since(sent.send_time));
            }
        }
        self.retransmit = kept;

        if let Some(rtt) = rtt_sample {
            self.update_rtt(rtt.as_micros() as u64);
        }
        if acked_bytes > 0 {
            self.nb_retransmit = 0;
            self.congestion
                .notify(congestion::Event::Acknowledged { bytes: acked_bytes });
            self.latest_progress_time = now;
        }
    }

    fn update_rtt(&mut self, rtt: u64) {
        if self.rtt_variant == 0 && self.smoothed_rtt == INITIAL_RTT_MICROS {
            self.smoothed_rtt = rtt;
            self.rtt_variant = rtt / 2;
            self.rtt_min = rtt;
        } else {
            let delta = rtt.abs_diff(self.smoothed_rtt);
            if rtt >= self.smoothed_rtt {
                self.smoothed_rtt += delta / 8;
            } else {
                self.smoothed_rtt -= delta / 8;
            }
            if delta >= self.rtt_variant {
                self.rtt_variant += (delta - self.rtt_variant) / 4;
            } else {
                self.rtt_variant -= (self.rtt_variant - delta) / 4;
            }
            self.rtt_min = self.rtt_min.min(rtt);
        }

        self.retransmit_timer =
            (self.smoothed_rtt + 4 * self.rtt_variant).max(INITIAL_RETRANSMIT_TIMER_MICROS / 2);
        self.congestion.notify(congestion::Event::RttMeasurement {
            rtt: Duration::from_micros(rtt),
        });
    }

    // === transport parameters =============================================

    /// Installs the peer's parameter set once the handshake surfaces it
    pub(crate) fn apply_remote_parameters(&mut self, params: TransportParameters) {
        self.maxdata_remote = params.initial_max_data_bytes();
        self.max_stream_id_remote = params.initial_max_stream_id;
        for stream in self.streams.values_mut() {
            stream.maxdata_remote = u64::from(params.initial_max_stream_data);
        }
        if let Some(token) = params.stateless_reset_token {
            if self.is_client {
                self.reset_secret = token;
            }
        }
        self.remote_parameters = params;
    }

    /// Microseconds of silence tolerated before the connection dies
    pub(crate) fn idle_timeout_micros(&self) -> u64 {
        u64::from(self.local_parameters.idle_timeout) * 1_000_000
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("initial_cnxid", &self.initial_cnxid)
            .field("server_cnxid", &self.server_cnxid)
            .field("version", &self.version)
            .field("send_sequence", &self.send_sequence)
            .field("highest_ack_sent", &self.highest_ack_sent)
            .field("bytes_in_transit", &self.bytes_in_transit)
            .field("nb_retransmit", &self.nb_retransmit)
            .field("latest_retransmit_time", &self.latest_retransmit_time)
            .finish_non_exhaustive()
    }
}
