// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide QUIC context
//!
//! Owns every connection, the two demultiplexing indexes (connection id
//! and peer address), the queue of stateless packets (version negotiation
//! and stateless resets), and the wake-time ordering the embedder polls.

use crate::{
    congestion,
    connection::{Connection, ConnectionHandle, State, StreamDataCallback},
    error::LocalError,
    limits::Limits,
};
use alloc::{
    borrow::ToOwned,
    boxed::Box,
    collections::{BTreeSet, VecDeque},
    string::String,
    vec,
    vec::Vec,
};
use core::{net::SocketAddr, time::Duration};
use hashbrown::HashMap;
use minquic_codec::EncoderBuffer;
use minquic_core::{
    crypto::{Engine, SessionConfig},
    fnv1a,
    packet::{self, Header, PacketType, MAX_PACKET_SIZE},
    time::Timestamp,
};

/// Client initials below this size are dropped without a response
const MIN_INITIAL_SIZE: usize = 1200;

/// Constructor used when a connection is created without an explicit
/// stream-data callback
pub type CallbackFactory = Box<dyn Fn() -> StreamDataCallback>;

pub struct Config {
    /// Accept incoming connections and answer unknown short headers with
    /// stateless resets
    pub server: bool,
    /// Demand a stateless retry (HRR) from unvalidated clients
    pub cookie_mode: bool,
    pub limits: Limits,
    pub alpn: Option<String>,
    pub congestion: congestion::Factory,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: false,
            cookie_mode: false,
            limits: Limits::default(),
            alpn: None,
            congestion: congestion::new_reno_factory,
        }
    }
}

/// An outbound datagram not bound to any connection
#[derive(Debug)]
pub struct StatelessPacket {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

pub struct Endpoint {
    engine: Box<dyn Engine>,
    config: Config,
    default_callback: Option<CallbackFactory>,

    connections: HashMap<u64, Connection>,
    cnx_id_index: HashMap<u64, ConnectionHandle>,
    net_index: HashMap<SocketAddr, ConnectionHandle>,
    wake_order: BTreeSet<(Timestamp, ConnectionHandle)>,
    stateless: VecDeque<StatelessPacket>,
    next_handle: u64,
}

impl Endpoint {
    pub fn new(config: Config, engine: Box<dyn Engine>) -> Self {
        Self {
            engine,
            config,
            default_callback: None,
            connections: HashMap::new(),
            cnx_id_index: HashMap::new(),
            net_index: HashMap::new(),
            wake_order: BTreeSet::new(),
            stateless: VecDeque::new(),
            next_handle: 1,
        }
    }

    pub fn set_default_callback(&mut self, factory: CallbackFactory) {
        self.default_callback = Some(factory);
    }

    pub fn is_server(&self) -> bool {
        self.config.server
    }

    /// Demand (or stop demanding) a stateless retry from new clients,
    /// e.g. while under load
    pub fn set_cookie_mode(&mut self, enabled: bool) {
        self.config.cookie_mode = enabled;
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn handles(&self) -> impl Iterator<Item = ConnectionHandle> + '_ {
        self.wake_order.iter().map(|(_, handle)| *handle)
    }

    pub fn connection(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.connections.get(&handle.0)
    }

    // === connection lifecycle =============================================

    /// Creates a client connection towards `addr`. The first handshake
    /// flight is queued immediately; the first datagram comes out of the
    /// next `prepare_packet` call.
    pub fn client_connection(
        &mut self,
        addr: SocketAddr,
        now: Timestamp,
        preferred_version: u32,
        server_name: Option<&str>,
        alpn: Option<&str>,
        callback: Option<StreamDataCallback>,
    ) -> ConnectionHandle {
        let handle = self.allocate_handle();
        let session_config = SessionConfig {
            server_name: server_name.map(str::to_owned),
            alpn: alpn
                .map(str::to_owned)
                .or_else(|| self.config.alpn.clone()),
            enforce_cookie: false,
        };
        let callback = callback.or_else(|| self.default_callback.as_ref().map(|factory| factory()));

        let connection = Connection::new(
            handle,
            &mut *self.engine,
            self.config.limits,
            self.config.congestion,
            addr,
            now,
            true,
            0,
            preferred_version,
            session_config,
            callback,
        );

        self.install(connection, now)
    }

    fn create_server_connection(
        &mut self,
        addr: SocketAddr,
        now: Timestamp,
        cnx_id: u64,
        version: u32,
    ) -> ConnectionHandle {
        let handle = self.allocate_handle();
        let session_config = SessionConfig {
            server_name: None,
            alpn: self.config.alpn.clone(),
            enforce_cookie: self.config.cookie_mode,
        };
        let callback = self.default_callback.as_ref().map(|factory| factory());

        let connection = Connection::new(
            handle,
            &mut *self.engine,
            self.config.limits,
            self.config.congestion,
            addr,
            now,
            false,
            cnx_id,
            version,
            session_config,
            callback,
        );

        self.install(connection, now)
    }

    fn allocate_handle(&mut self) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn install(&mut self, connection: Connection, now: Timestamp) -> ConnectionHandle {
        let handle = connection.handle();
        let initial = connection.initial_cnxid();
        let server = connection.server_cnxid();
        let addr = connection.peer_addr();

        self.wake_order.insert((now, handle));
        self.connections.insert(handle.0, connection);

        if initial != 0 {
            let _ = self.register_cnx_id(handle, initial);
        }
        if server != 0 {
            let _ = self.register_cnx_id(handle, server);
        }
        // first connection for an address wins the index, as with the
        // connection ids
        self.net_index.entry(addr).or_insert(handle);

        handle
    }

    /// Binds an additional connection id. An id already bound to any
    /// connection is rejected and the existing binding is left intact.
    fn register_cnx_id(&mut self, handle: ConnectionHandle, cnx_id: u64) -> Result<(), LocalError> {
        match self.cnx_id_index.entry(cnx_id) {
            hashbrown::hash_map::Entry::Occupied(_) => Err(LocalError::DuplicateConnectionId),
            hashbrown::hash_map::Entry::Vacant(entry) => {
                entry.insert(handle);
                if let Some(connection) = self.connections.get_mut(&handle.0) {
                    if connection.initial_cnxid() != cnx_id && connection.server_cnxid() != cnx_id {
                        connection.extra_cnxids.push(cnx_id);
                    }
                }
                Ok(())
            }
        }
    }

    /// Releases a connection and every index entry pointing at it.
    /// Usually called once the state machine reports *disconnected*.
    pub fn delete_connection(&mut self, handle: ConnectionHandle) -> Result<(), LocalError> {
        let connection = self
            .connections
            .remove(&handle.0)
            .ok_or(LocalError::UnknownConnection)?;

        let mut ids = vec![connection.initial_cnxid(), connection.server_cnxid()];
        ids.extend(connection.extra_cnxids.iter().copied());
        for id in ids {
            if self.cnx_id_index.get(&id) == Some(&handle) {
                self.cnx_id_index.remove(&id);
            }
        }
        if self.net_index.get(&connection.peer_addr()) == Some(&handle) {
            self.net_index.remove(&connection.peer_addr());
        }
        self.wake_order.remove(&(connection.next_wake_time(), handle));
        Ok(())
    }

    // === embedder operations ==============================================

    /// Queues application data on a stream of a connection
    pub fn add_to_stream(
        &mut self,
        handle: ConnectionHandle,
        stream_id: u32,
        data: &[u8],
        fin: bool,
    ) -> Result<(), LocalError> {
        self.with_connection_at(handle, None, |connection, _| {
            connection.add_to_stream(stream_id, data, fin)
        })?
    }

    pub fn reset_stream(
        &mut self,
        handle: ConnectionHandle,
        stream_id: u32,
    ) -> Result<(), LocalError> {
        self.with_connection_at(handle, None, |connection, _| connection.reset_stream(stream_id))?
    }

    /// Starts an orderly close of a connection
    pub fn close(&mut self, handle: ConnectionHandle) -> Result<(), LocalError> {
        self.with_connection_at(handle, None, |connection, _| connection.close())?
    }

    /// Feeds one received datagram into the endpoint
    pub fn incoming(&mut self, bytes: &[u8], from: SocketAddr, now: Timestamp) {
        if bytes.is_empty() || bytes.len() > MAX_PACKET_SIZE {
            return;
        }
        let Ok(header) = Header::parse(bytes) else {
            return;
        };

        let handle = header
            .cnx_id
            .and_then(|id| self.cnx_id_index.get(&id).copied())
            .or_else(|| self.net_index.get(&from).copied());

        let Some(handle) = handle else {
            self.incoming_unknown(bytes, &header, from, now);
            return;
        };

        let _ = self.with_connection_at(handle, Some(now), |connection, engine| {
            connection.incoming(engine, bytes, header, now);
        });
        self.drain_pending_cnx_ids(handle);
    }

    /// Produces the next datagram for a connection, along with the
    /// address it must be sent to
    pub fn prepare_packet(
        &mut self,
        handle: ConnectionHandle,
        now: Timestamp,
    ) -> Result<Option<(Vec<u8>, SocketAddr)>, LocalError> {
        self.with_connection_at(handle, Some(now), |connection, engine| {
            let addr = connection.peer_addr();
            connection
                .prepare_packet(engine, now)
                .map(|datagram| (datagram, addr))
        })
    }

    /// First connection whose wake time has passed
    pub fn next_ready(&self, now: Timestamp) -> Option<ConnectionHandle> {
        self.wake_order
            .iter()
            .next()
            .filter(|(wake, _)| *wake <= now)
            .map(|(_, handle)| *handle)
    }

    /// Time until the earliest connection needs service, capped at `max`
    pub fn next_wake_delay(&self, now: Timestamp, max: Duration) -> Duration {
        match self.wake_order.iter().next() {
            Some((wake, _)) if *wake > now => wake.saturating_duration_since(now).min(max),
            Some(_) => Duration::ZERO,
            None => max,
        }
    }

    /// Drains the queue of connection-less responses
    pub fn dequeue_stateless_packet(&mut self) -> Option<StatelessPacket> {
        self.stateless.pop_front()
    }

    // === internals ========================================================

    /// Runs an operation on one connection and re-files it in the wake
    /// order afterwards. With a clock reading the wake time is properly
    /// recomputed; without one the connection is made immediately ready
    /// and the next `prepare_packet` call settles it.
    fn with_connection_at<T>(
        &mut self,
        handle: ConnectionHandle,
        now: Option<Timestamp>,
        operation: impl FnOnce(&mut Connection, &mut dyn Engine) -> T,
    ) -> Result<T, LocalError> {
        let connection = self
            .connections
            .get_mut(&handle.0)
            .ok_or(LocalError::UnknownConnection)?;
        let old_wake = connection.next_wake_time();

        let result = operation(connection, &mut *self.engine);

        match now {
            Some(now) => connection.set_next_wake_time(now),
            None => {
                if connection.state() != State::Disconnected {
                    connection.next_wake_time = Timestamp::from_micros(0);
                }
            }
        }

        let new_wake = connection.next_wake_time();
        if new_wake != old_wake {
            self.wake_order.remove(&(old_wake, handle));
            self.wake_order.insert((new_wake, handle));
        }
        Ok(result)
    }

    fn drain_pending_cnx_ids(&mut self, handle: ConnectionHandle) {
        let ids: Vec<u64> = match self.connections.get_mut(&handle.0) {
            Some(connection) => connection.pending_cnx_ids.drain(..).collect(),
            None => return,
        };
        for id in ids {
            let _ = self.register_cnx_id(handle, id);
        }
    }

    fn incoming_unknown(
        &mut self,
        bytes: &[u8],
        header: &Header,
        from: SocketAddr,
        now: Timestamp,
    ) {
        if !self.config.server {
            return;
        }

        match header.packet_type {
            PacketType::ClientInitial => {
                if bytes.len() < MIN_INITIAL_SIZE || fnv1a::verify(bytes).is_none() {
                    return;
                }
                let Some(cnx_id) = header.cnx_id else { return };

                if !minquic_core::is_supported_version(header.version) {
                    self.queue_version_negotiation(header, from);
                    return;
                }

                tracing::debug!(%from, cnx_id, "accepting connection");
                let handle = self.create_server_connection(from, now, cnx_id, header.version);
                let header = *header;
                let _ = self.with_connection_at(handle, Some(now), |connection, engine| {
                    connection.incoming(engine, bytes, header, now);
                });
                self.drain_pending_cnx_ids(handle);
            }
            PacketType::OneRttProtectedPhi0 | PacketType::OneRttProtectedPhi1 => {
                self.queue_stateless_reset(header, from);
            }
            _ => {}
        }
    }

    fn queue_version_negotiation(&mut self, header: &Header, to: SocketAddr) {
        let mut storage = [0u8; MAX_PACKET_SIZE];
        let mut encoder = EncoderBuffer::new(&mut storage);

        let write = (|| -> minquic_codec::EncoderResult {
            packet::encode_long_header(
                &mut encoder,
                PacketType::VersionNegotiation,
                header.cnx_id.unwrap_or(0),
                header.packet_number,
                header.version,
            )?;
            for version in minquic_core::SUPPORTED_VERSIONS {
                encoder.encode_u32(*version)?;
            }
            Ok(())
        })();
        if write.is_err() {
            return;
        }

        let length = encoder.len();
        let Some(protected_len) = fnv1a::protect(&mut storage, length) else {
            return;
        };
        tracing::debug!(%to, "queueing version negotiation");
        self.stateless.push_back(StatelessPacket {
            to,
            bytes: storage[..protected_len].to_vec(),
        });
    }

    /// Answers an unknown short-header packet with a stateless reset
    /// whose token the peer can recognise
    fn queue_stateless_reset(&mut self, header: &Header, to: SocketAddr) {
        let Some(cnx_id) = header.cnx_id else {
            // without a connection id there is no token to derive
            return;
        };
        let token = self.engine.reset_token(cnx_id);

        let mut bytes = Vec::with_capacity(64);
        // plausible short header: connection id present, 1-byte number
        bytes.push(0x41);
        bytes.extend_from_slice(&cnx_id.to_be_bytes());
        let mut filler = [0u8; 23];
        self.engine.random_bytes(&mut filler);
        bytes.extend_from_slice(&filler);
        bytes.extend_from_slice(&token);

        tracing::debug!(%to, cnx_id, "queueing stateless reset");
        self.stateless.push_back(StatelessPacket { to, bytes });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NullEngine;
    use minquic_core::FIRST_INTEROP_VERSION;

    fn endpoint(server: bool) -> Endpoint {
        Endpoint::new(
            Config {
                server,
                ..Config::default()
            },
            Box::new(NullEngine::new(7)),
        )
    }

    fn peer() -> SocketAddr {
        "10.0.0.2:4433".parse().expect("literal address")
    }

    #[test]
    fn first_flight_is_a_padded_client_initial() {
        let mut endpoint = endpoint(false);
        let now = Timestamp::from_micros(1);
        let handle = endpoint.client_connection(peer(), now, 0, None, None, None);

        assert_eq!(
            endpoint.next_wake_delay(now, Duration::from_secs(1)),
            Duration::ZERO
        );

        let (bytes, to) = endpoint.prepare_packet(handle, now).unwrap().unwrap();
        assert_eq!(to, peer());
        // padded to the IPv4 pre-handshake budget, checksum included
        assert_eq!(bytes.len(), packet::INITIAL_MTU_IPV4);
        assert!(fnv1a::verify(&bytes).is_some());

        let header = Header::parse(&bytes).unwrap();
        assert_eq!(header.packet_type, PacketType::ClientInitial);
        assert_eq!(header.version, FIRST_INTEROP_VERSION);
        assert_eq!(
            header.cnx_id,
            Some(endpoint.connection(handle).unwrap().initial_cnxid())
        );

        assert_eq!(
            endpoint.connection(handle).unwrap().state(),
            State::ClientInitSent
        );
        // nothing more to say until the server answers or the timer fires
        assert!(endpoint.prepare_packet(handle, now).unwrap().is_none());
    }

    #[test]
    fn duplicate_connection_ids_are_rejected_without_side_effects() {
        let mut endpoint = endpoint(false);
        let now = Timestamp::from_micros(1);
        let first = endpoint.client_connection(peer(), now, 0, None, None, None);
        let second = endpoint.client_connection(peer(), now, 0, None, None, None);

        let taken = endpoint.connection(first).unwrap().initial_cnxid();
        assert_eq!(
            endpoint.register_cnx_id(second, taken),
            Err(LocalError::DuplicateConnectionId)
        );
        // the existing binding stays with the first connection
        assert_eq!(endpoint.cnx_id_index.get(&taken), Some(&first));
        assert!(endpoint
            .connection(second)
            .unwrap()
            .extra_cnxids
            .is_empty());
    }

    #[test]
    fn unsupported_version_draws_version_negotiation() {
        let mut endpoint = endpoint(true);
        let now = Timestamp::from_micros(1);

        let mut storage = [0u8; packet::MAX_PACKET_SIZE];
        let mut encoder = EncoderBuffer::new(&mut storage);
        packet::encode_long_header(
            &mut encoder,
            PacketType::ClientInitial,
            0x1122_3344,
            1,
            0x0102_0304,
        )
        .unwrap();
        while encoder.len() < MIN_INITIAL_SIZE + 32 {
            encoder.encode_u8(0).unwrap();
        }
        let length = encoder.len();
        let protected = fnv1a::protect(&mut storage, length).unwrap();

        endpoint.incoming(&storage[..protected], peer(), now);
        assert_eq!(endpoint.connection_count(), 0);

        let response = endpoint.dequeue_stateless_packet().unwrap();
        assert_eq!(response.to, peer());
        let header = Header::parse(&response.bytes).unwrap();
        assert_eq!(header.packet_type, PacketType::VersionNegotiation);
        assert_eq!(header.cnx_id, Some(0x1122_3344));

        let verified = fnv1a::verify(&response.bytes).unwrap();
        let buffer = minquic_codec::DecoderBuffer::new(&response.bytes[header.header_len..verified]);
        let (first_offered, _) = buffer.decode_u32().unwrap();
        assert_eq!(first_offered, FIRST_INTEROP_VERSION);
    }

    #[test]
    fn unknown_short_header_draws_a_stateless_reset_on_servers_only() {
        let now = Timestamp::from_micros(1);
        let mut orphan = vec![0x41u8];
        orphan.extend_from_slice(&0xfeed_f00du64.to_be_bytes());
        orphan.extend_from_slice(&[0xab; 32]);

        let mut server = endpoint(true);
        server.incoming(&orphan, peer(), now);
        let reset = server.dequeue_stateless_packet().unwrap();
        assert!(reset.bytes.len() > minquic_core::crypto::RESET_SECRET_LEN);
        // the token is derived from the orphaned connection id
        let token = &reset.bytes[reset.bytes.len() - minquic_core::crypto::RESET_SECRET_LEN..];
        assert_eq!(token, &server.engine.reset_token(0xfeed_f00d)[..]);

        let mut client = endpoint(false);
        client.incoming(&orphan, peer(), now);
        assert!(client.dequeue_stateless_packet().is_none());
    }

    #[test]
    fn runt_client_initials_are_ignored() {
        let mut endpoint = endpoint(true);
        let now = Timestamp::from_micros(1);

        let mut storage = [0u8; 256];
        let mut encoder = EncoderBuffer::new(&mut storage);
        packet::encode_long_header(
            &mut encoder,
            PacketType::ClientInitial,
            9,
            1,
            FIRST_INTEROP_VERSION,
        )
        .unwrap();
        let length = encoder.len();
        let protected = fnv1a::protect(&mut storage, length).unwrap();

        endpoint.incoming(&storage[..protected], peer(), now);
        assert_eq!(endpoint.connection_count(), 0);
        assert!(endpoint.dequeue_stateless_packet().is_none());
    }
}
