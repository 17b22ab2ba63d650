// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Test instruments: a deterministic crypto engine that performs no real
//! cryptography, a callback recorder, and a two-endpoint simulated link
//! with programmable loss
//!
//! The null engine reduces the handshake to a transport-parameter
//! exchange, the way testing endpoints in real stacks do. It still
//! exercises every transport mechanism: flights travel on stream 0, keys
//! appear at the 1-RTT transition, and sealed packets fail to open when
//! tampered with.

use crate::{
    connection::{ConnectionHandle, StreamDataCallback},
    endpoint::{Config, Endpoint},
    limits::Limits,
    stream::CallbackEvent,
};
use alloc::{
    boxed::Box,
    collections::VecDeque,
    rc::Rc,
    string::String,
    vec::Vec,
};
use core::{cell::RefCell, net::SocketAddr, time::Duration};
use minquic_core::{
    crypto::{
        label, CryptoError, Engine, HandshakeResult, HandshakeStatus, Key, Mode, Session,
        SessionConfig, RESET_SECRET_LEN,
    },
    fnv1a,
    time::Timestamp,
};

// === deterministic randomness =============================================

/// xorshift64*, good enough for reproducible tests
#[derive(Debug, Clone)]
pub struct TestRng(u64);

impl TestRng {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    pub fn fill(&mut self, output: &mut [u8]) {
        for chunk in output.chunks_mut(8) {
            let bytes = self.next_u64().to_be_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    /// Bernoulli draw with probability `percent / 100`
    pub fn one_in_a_hundred(&mut self, percent: u64) -> bool {
        self.next_u64() % 100 < percent
    }
}

// === null crypto engine ===================================================

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_FLIGHT: u8 = 2;
const MSG_FINISHED: u8 = 3;
const MSG_RETRY: u8 = 4;

/// Crypto engine that exchanges transport parameters and nothing else.
/// Secrets derive from the handshake transcript, so both sides agree on
/// them without any key schedule.
pub struct NullEngine {
    rng: TestRng,
    reset_seed: [u8; 32],
    retry_secret: u64,
}

impl NullEngine {
    pub fn new(seed: u64) -> Self {
        let mut rng = TestRng::new(seed);
        let mut reset_seed = [0u8; 32];
        rng.fill(&mut reset_seed);
        let retry_secret = rng.next_u64();
        Self {
            rng,
            reset_seed,
            retry_secret,
        }
    }
}

impl Engine for NullEngine {
    fn random_bytes(&mut self, output: &mut [u8]) {
        self.rng.fill(output);
    }

    fn reset_token(&self, cnx_id: u64) -> [u8; RESET_SECRET_LEN] {
        let mut seeded = self.reset_seed.to_vec();
        seeded.extend_from_slice(&cnx_id.to_be_bytes());
        let front = fnv1a::hash(&seeded);
        seeded.reverse();
        let back = fnv1a::hash(&seeded);

        let mut token = [0u8; RESET_SECRET_LEN];
        token[..8].copy_from_slice(&front.to_be_bytes());
        token[8..].copy_from_slice(&back.to_be_bytes());
        token
    }

    fn new_session(&mut self, mode: Mode, config: SessionConfig) -> Box<dyn Session> {
        Box::new(NullSession {
            mode,
            config,
            retry_secret: self.retry_secret,
            local_parameters: Vec::new(),
            peer_parameters: None,
            inbuf: Vec::new(),
            transcript: 0xcbf2_9ce4_8422_2325,
            cookie: None,
            complete: false,
        })
    }
}

/// Handshake messages are `[type: u8][len: u16][body]`; bodies are
/// length-prefixed fields. Chunked delivery is tolerated by buffering.
pub struct NullSession {
    mode: Mode,
    config: SessionConfig,
    retry_secret: u64,
    local_parameters: Vec<u8>,
    peer_parameters: Option<Vec<u8>>,
    inbuf: Vec<u8>,
    transcript: u64,
    cookie: Option<u64>,
    complete: bool,
}

fn push_message(out: &mut Vec<u8>, kind: u8, body: &[u8]) {
    out.push(kind);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
}

fn mix_transcript(transcript: &mut u64, message: &[u8]) {
    for byte in message {
        *transcript ^= u64::from(*byte);
        *transcript = transcript.wrapping_mul(0x0000_0100_0000_01b3);
    }
}

fn push_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u16).to_be_bytes());
    out.extend_from_slice(field);
}

fn pop_field<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    if input.len() < 2 {
        return None;
    }
    let len = usize::from(u16::from_be_bytes([input[0], input[1]]));
    if input.len() < 2 + len {
        return None;
    }
    let (field, rest) = input[2..].split_at(len);
    *input = rest;
    Some(field)
}

impl NullSession {
    fn client_hello(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        push_field(&mut body, &self.local_parameters.clone());
        body.extend_from_slice(&self.cookie.unwrap_or(0).to_be_bytes());
        let server_name = self.config.server_name.clone().unwrap_or_default();
        push_field(&mut body, server_name.as_bytes());
        let alpn = self.config.alpn.clone().unwrap_or_default();
        push_field(&mut body, alpn.as_bytes());

        let mut message = Vec::new();
        push_message(&mut message, MSG_CLIENT_HELLO, &body);
        message
    }

    /// Pops one complete `[type][len][body]` message off the input buffer
    fn next_message(&mut self) -> Option<(u8, Vec<u8>)> {
        if self.inbuf.len() < 3 {
            return None;
        }
        let kind = self.inbuf[0];
        let body_len = usize::from(u16::from_be_bytes([self.inbuf[1], self.inbuf[2]]));
        if self.inbuf.len() < 3 + body_len {
            return None;
        }
        let message: Vec<u8> = self.inbuf.drain(..3 + body_len).collect();
        Some((kind, message))
    }

    fn process(&mut self, kind: u8, message: Vec<u8>) -> Result<HandshakeResult, CryptoError> {
        let body = &message[3..];
        match (self.mode, kind) {
            (Mode::Server, MSG_CLIENT_HELLO) => {
                let mut cursor = body;
                let truncated = CryptoError {
                    reason: "truncated client hello",
                };
                let params = pop_field(&mut cursor).ok_or(truncated)?.to_vec();
                if cursor.len() < 8 {
                    return Err(truncated);
                }
                let cookie = u64::from_be_bytes(cursor[..8].try_into().expect("checked length"));
                cursor = &cursor[8..];
                let server_name = pop_field(&mut cursor).ok_or(truncated)?.to_vec();
                let alpn = pop_field(&mut cursor).ok_or(truncated)?.to_vec();

                if self.config.enforce_cookie && cookie != self.retry_secret {
                    let mut output = Vec::new();
                    push_message(&mut output, MSG_RETRY, &self.retry_secret.to_be_bytes());
                    return Ok(HandshakeResult {
                        output,
                        status: HandshakeStatus::StatelessRetry,
                    });
                }

                self.peer_parameters = Some(params);
                if !server_name.is_empty() {
                    self.config.server_name = String::from_utf8(server_name).ok();
                }
                if !alpn.is_empty() {
                    self.config.alpn = String::from_utf8(alpn).ok();
                }
                mix_transcript(&mut self.transcript, &message);

                let mut output = Vec::new();
                let mut flight = Vec::new();
                push_field(&mut flight, &self.local_parameters.clone());
                push_message(&mut output, MSG_SERVER_FLIGHT, &flight);
                mix_transcript(&mut self.transcript, &output);

                self.complete = true;
                Ok(HandshakeResult {
                    output,
                    status: HandshakeStatus::Complete,
                })
            }
            (Mode::Server, MSG_FINISHED) => Ok(HandshakeResult {
                output: Vec::new(),
                status: HandshakeStatus::Complete,
            }),
            (Mode::Client, MSG_RETRY) => {
                if body.len() < 8 {
                    return Err(CryptoError {
                        reason: "short retry",
                    });
                }
                self.cookie = Some(u64::from_be_bytes(body[..8].try_into().expect("checked")));
                // transcript restarts with the retried hello
                self.transcript = 0xcbf2_9ce4_8422_2325;
                let hello = self.client_hello();
                mix_transcript(&mut self.transcript, &hello);
                Ok(HandshakeResult {
                    output: hello,
                    status: HandshakeStatus::InProgress,
                })
            }
            (Mode::Client, MSG_SERVER_FLIGHT) => {
                if body.len() < 2 {
                    return Err(CryptoError {
                        reason: "short server flight",
                    });
                }
                let params_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
                if body.len() < 2 + params_len {
                    return Err(CryptoError {
                        reason: "truncated server flight",
                    });
                }
                self.peer_parameters = Some(body[2..2 + params_len].to_vec());
                mix_transcript(&mut self.transcript, &message);

                let mut output = Vec::new();
                push_message(&mut output, MSG_FINISHED, &[]);
                self.complete = true;
                Ok(HandshakeResult {
                    output,
                    status: HandshakeStatus::Complete,
                })
            }
            _ => Err(CryptoError {
                reason: "unexpected handshake message",
            }),
        }
    }
}

impl Session for NullSession {
    fn handshake(&mut self, input: &[u8]) -> Result<HandshakeResult, CryptoError> {
        if input.is_empty() && self.mode == Mode::Client && self.inbuf.is_empty() {
            // client kick-off
            let hello = self.client_hello();
            mix_transcript(&mut self.transcript, &hello);
            return Ok(HandshakeResult {
                output: hello,
                status: HandshakeStatus::InProgress,
            });
        }

        self.inbuf.extend_from_slice(input);

        let mut result = HandshakeResult {
            output: Vec::new(),
            status: if self.complete {
                HandshakeStatus::Complete
            } else {
                HandshakeStatus::InProgress
            },
        };

        while let Some((kind, message)) = self.next_message() {
            let step = self.process(kind, message)?;
            result.output.extend_from_slice(&step.output);
            result.status = step.status;
            if result.status == HandshakeStatus::StatelessRetry {
                break;
            }
        }

        Ok(result)
    }

    fn export_secret(&self, secret_label: &str) -> Option<Vec<u8>> {
        if !self.complete {
            return None;
        }
        if secret_label != label::ONE_RTT_CLIENT
            && secret_label != label::ONE_RTT_SERVER
            && secret_label != label::ZERO_RTT
        {
            return None;
        }

        let mut secret = secret_label.as_bytes().to_vec();
        secret.extend_from_slice(&self.transcript.to_be_bytes());
        Some(secret)
    }

    fn new_key(&self, secret: &[u8]) -> Box<dyn Key> {
        Box::new(NullKey {
            secret: secret.to_vec(),
        })
    }

    fn negotiated_protocol(&self) -> Option<&str> {
        self.config.alpn.as_deref()
    }

    fn server_name(&self) -> Option<&str> {
        self.config.server_name.as_deref()
    }

    fn set_transport_parameters(&mut self, body: Vec<u8>) {
        self.local_parameters = body;
    }

    fn peer_transport_parameters(&self) -> Option<&[u8]> {
        self.peer_parameters.as_deref()
    }
}

/// Copies the plaintext and appends a keyed 16-byte check value; `open`
/// recomputes and compares it, so tampering and key mismatches both fail
pub struct NullKey {
    secret: Vec<u8>,
}

impl NullKey {
    fn tag(&self, plain: &[u8], sequence: u64, aad: &[u8]) -> [u8; 16] {
        let mut material = self.secret.clone();
        material.extend_from_slice(&sequence.to_be_bytes());
        material.extend_from_slice(aad);
        material.extend_from_slice(plain);
        let front = fnv1a::hash(&material);
        material.reverse();
        let back = fnv1a::hash(&material);

        let mut tag = [0u8; 16];
        tag[..8].copy_from_slice(&front.to_be_bytes());
        tag[8..].copy_from_slice(&back.to_be_bytes());
        tag
    }
}

impl Key for NullKey {
    fn seal(&self, output: &mut [u8], plain: &[u8], sequence: u64, aad: &[u8]) -> usize {
        output[..plain.len()].copy_from_slice(plain);
        let tag = self.tag(plain, sequence, aad);
        output[plain.len()..plain.len() + tag.len()].copy_from_slice(&tag);
        plain.len() + tag.len()
    }

    fn open(&self, output: &mut [u8], sealed: &[u8], sequence: u64, aad: &[u8]) -> Option<usize> {
        let plain_len = sealed.len().checked_sub(16)?;
        let (plain, tag) = sealed.split_at(plain_len);
        if self.tag(plain, sequence, aad)[..] != tag[..] {
            return None;
        }
        output[..plain_len].copy_from_slice(plain);
        Some(plain_len)
    }
}

// === callback recorder ====================================================

/// Captures stream events delivered by a connection
#[derive(Clone, Default)]
pub struct Recorder {
    events: Rc<RefCell<Vec<(u32, Vec<u8>, CallbackEvent)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> StreamDataCallback {
        let events = self.events.clone();
        Box::new(move |_handle, stream_id, bytes, event| {
            events.borrow_mut().push((stream_id, bytes.to_vec(), event));
        })
    }

    pub fn events(&self) -> Vec<(u32, Vec<u8>, CallbackEvent)> {
        self.events.borrow().clone()
    }

    /// Concatenated data bytes seen on one stream
    pub fn stream_bytes(&self, stream_id: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (id, data, event) in self.events.borrow().iter() {
            if *id == stream_id && *event == CallbackEvent::Data {
                bytes.extend_from_slice(data);
            }
        }
        bytes
    }

    pub fn saw_event(&self, stream_id: u32, event: CallbackEvent) -> bool {
        self.events
            .borrow()
            .iter()
            .any(|(id, _, seen)| *id == stream_id && *seen == event)
    }
}

// === simulated link =======================================================

struct FlightEntry {
    deliver_at: Timestamp,
    to_server: bool,
    from: SocketAddr,
    bytes: Vec<u8>,
}

/// Two endpoints joined by a symmetric link with latency and programmable
/// loss. Time is virtual and event driven.
pub struct Link {
    pub client: Endpoint,
    pub server: Endpoint,
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub now: Timestamp,
    latency: Duration,
    in_flight: VecDeque<FlightEntry>,
    sent_to_server: u64,
    sent_to_client: u64,
    /// Bit `i` set drops datagram number `i` in that direction
    pub drop_mask_to_server: u64,
    pub drop_mask_to_client: u64,
    /// Random loss applied after the masks, in percent
    pub loss_percent: u64,
    /// Deliver every datagram twice, for duplicate-suppression coverage
    pub duplicate_delivery: bool,
    loss_rng: TestRng,
    pub datagrams_sent: u64,
}

pub fn endpoint_pair(seed: u64, server_limits: Limits) -> (Endpoint, Endpoint) {
    let client = Endpoint::new(
        Config {
            server: false,
            ..Config::default()
        },
        Box::new(NullEngine::new(seed)),
    );
    let server = Endpoint::new(
        Config {
            server: true,
            limits: server_limits,
            ..Config::default()
        },
        Box::new(NullEngine::new(seed.wrapping_add(0x9e37_79b9))),
    );
    (client, server)
}

impl Link {
    pub fn new(seed: u64) -> Self {
        Self::with_limits(seed, Limits::default())
    }

    /// A link whose server demands a stateless retry from new clients
    pub fn with_cookie_mode(seed: u64) -> Self {
        let mut link = Self::new(seed);
        link.server = Endpoint::new(
            Config {
                server: true,
                cookie_mode: true,
                ..Config::default()
            },
            Box::new(NullEngine::new(seed.wrapping_add(0x9e37_79b9))),
        );
        link
    }

    pub fn with_limits(seed: u64, server_limits: Limits) -> Self {
        let (client, server) = endpoint_pair(seed, server_limits);
        Self {
            client,
            server,
            client_addr: "10.0.0.1:4321".parse().expect("literal address"),
            server_addr: "10.0.0.2:4433".parse().expect("literal address"),
            now: Timestamp::from_micros(1_000_000),
            latency: Duration::from_millis(10),
            in_flight: VecDeque::new(),
            sent_to_server: 0,
            sent_to_client: 0,
            drop_mask_to_server: 0,
            drop_mask_to_client: 0,
            loss_percent: 0,
            duplicate_delivery: false,
            loss_rng: TestRng::new(seed ^ 0x5eed),
            datagrams_sent: 0,
        }
    }

    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    /// Opens a client connection towards the server endpoint
    pub fn connect(&mut self, callback: Option<StreamDataCallback>) -> ConnectionHandle {
        self.client.client_connection(
            self.server_addr,
            self.now,
            0,
            Some("test.example.com"),
            Some("minq-test"),
            callback,
        )
    }

    fn transmit(&mut self, to_server: bool, from: SocketAddr, bytes: Vec<u8>) {
        self.datagrams_sent += 1;
        let index = if to_server {
            let index = self.sent_to_server;
            self.sent_to_server += 1;
            index
        } else {
            let index = self.sent_to_client;
            self.sent_to_client += 1;
            index
        };

        let mask = if to_server {
            self.drop_mask_to_server
        } else {
            self.drop_mask_to_client
        };
        if index < 64 && mask & (1 << index) != 0 {
            return;
        }
        if self.loss_percent > 0 && self.loss_rng.one_in_a_hundred(self.loss_percent) {
            return;
        }

        if self.duplicate_delivery {
            self.in_flight.push_back(FlightEntry {
                deliver_at: self.now + self.latency,
                to_server,
                from,
                bytes: bytes.clone(),
            });
        }
        self.in_flight.push_back(FlightEntry {
            deliver_at: self.now + self.latency,
            to_server,
            from,
            bytes,
        });
    }

    /// Collects everything both endpoints want to send right now
    fn pump_sends(&mut self) {
        let mut outbound: Vec<(bool, SocketAddr, Vec<u8>)> = Vec::new();

        while let Some(packet) = self.client.dequeue_stateless_packet() {
            outbound.push((true, self.client_addr, packet.bytes));
        }
        while let Some(packet) = self.server.dequeue_stateless_packet() {
            outbound.push((false, self.server_addr, packet.bytes));
        }

        for _ in 0..64 {
            let Some(handle) = self.client.next_ready(self.now) else {
                break;
            };
            match self.client.prepare_packet(handle, self.now) {
                Ok(Some((bytes, _))) => outbound.push((true, self.client_addr, bytes)),
                _ => break,
            }
        }
        for _ in 0..64 {
            let Some(handle) = self.server.next_ready(self.now) else {
                break;
            };
            match self.server.prepare_packet(handle, self.now) {
                Ok(Some((bytes, _))) => outbound.push((false, self.server_addr, bytes)),
                _ => break,
            }
        }

        for (to_server, from, bytes) in outbound {
            self.transmit(to_server, from, bytes);
        }
    }

    fn deliver_due(&mut self) {
        while let Some(entry) = self.in_flight.front() {
            if entry.deliver_at > self.now {
                break;
            }
            let entry = self.in_flight.pop_front().expect("front just observed");
            if entry.to_server {
                self.server.incoming(&entry.bytes, entry.from, self.now);
            } else {
                self.client.incoming(&entry.bytes, entry.from, self.now);
            }
        }
    }

    /// One simulation step: send, deliver, then advance virtual time to
    /// the next interesting instant
    pub fn step(&mut self) {
        self.pump_sends();
        self.deliver_due();

        let horizon = Duration::from_millis(250);
        let mut advance = self
            .client
            .next_wake_delay(self.now, horizon)
            .min(self.server.next_wake_delay(self.now, horizon));
        if let Some(entry) = self.in_flight.front() {
            advance = advance.min(entry.deliver_at.saturating_duration_since(self.now));
        }
        self.now = self.now + advance.max(Duration::from_micros(100));
    }

    /// Steps until `predicate` holds or `timeout` virtual time elapsed.
    /// Returns whether the predicate held.
    pub fn run_until(
        &mut self,
        timeout: Duration,
        mut predicate: impl FnMut(&Link) -> bool,
    ) -> bool {
        let deadline = self.now + timeout;
        while self.now < deadline {
            if predicate(self) {
                return true;
            }
            self.step();
        }
        predicate(self)
    }

    /// Convenience: the (single) server-side connection, once created
    pub fn server_handle(&self) -> Option<ConnectionHandle> {
        self.server.handles().next()
    }
}
