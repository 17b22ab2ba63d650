// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contract between the transport and the cryptographic engine
//!
//! The transport never touches TLS or AEAD internals. It drives an
//! injected [`Engine`] through these traits: one [`Session`] per
//! connection consumes and produces stream-0 handshake bytes, exports the
//! 1-RTT traffic secrets, and mints [`Key`]s that seal and open packet
//! payloads. Nothing here performs I/O.

use alloc::{boxed::Box, string::String, vec::Vec};
use core::fmt;

pub mod label {
    //! Exporter labels for the traffic secrets

    pub const ZERO_RTT: &str = "EXPORTER-QUIC 0-RTT Secret";
    pub const ONE_RTT_CLIENT: &str = "EXPORTER-QUIC client 1-RTT Secret";
    pub const ONE_RTT_SERVER: &str = "EXPORTER-QUIC server 1-RTT Secret";
}

/// Tag appended by AEAD protection
pub const AEAD_TAG_LEN: usize = 16;

/// Size of the per-connection stateless reset secret
pub const RESET_SECRET_LEN: usize = 16;

/// Entropy behind the per-endpoint reset-token derivation
pub const RESET_SEED_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CryptoError {
    pub reason: &'static str,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "crypto failure: {}", self.reason)
    }
}

/// Outcome of feeding handshake bytes to the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// More flights are expected
    InProgress,
    /// The handshake finished; 1-RTT secrets are exportable
    Complete,
    /// The engine wants the peer to prove address ownership first; the
    /// produced flight is a hello-retry and the session must be restarted
    StatelessRetry,
}

/// Bytes to send on stream 0 plus the resulting state
#[derive(Debug)]
pub struct HandshakeResult {
    pub output: Vec<u8>,
    pub status: HandshakeStatus,
}

/// AEAD context for one direction of a connection
pub trait Key {
    /// Seals `plain` into `output`, returning the sealed length.
    /// `output` must hold `plain.len() + AEAD_TAG_LEN` bytes.
    fn seal(&self, output: &mut [u8], plain: &[u8], sequence: u64, aad: &[u8]) -> usize;

    /// Opens `sealed` into `output`, returning the plaintext length, or
    /// `None` when authentication fails
    fn open(&self, output: &mut [u8], sealed: &[u8], sequence: u64, aad: &[u8]) -> Option<usize>;
}

/// Per-connection handshake state owned by the TLS adapter
pub trait Session {
    /// Advances the handshake with `input` bytes from the peer (empty on
    /// the client's first call). The returned output is queued on
    /// stream 0.
    fn handshake(&mut self, input: &[u8]) -> Result<HandshakeResult, CryptoError>;

    /// Exports a traffic secret once the handshake allows it
    fn export_secret(&self, label: &str) -> Option<Vec<u8>>;

    /// Creates an AEAD context from an exported secret
    fn new_key(&self, secret: &[u8]) -> Box<dyn Key>;

    fn negotiated_protocol(&self) -> Option<&str>;

    fn server_name(&self) -> Option<&str>;

    /// Sets the transport-parameter extension body this endpoint offers
    fn set_transport_parameters(&mut self, body: Vec<u8>);

    /// Extension body received from the peer, once seen
    fn peer_transport_parameters(&self) -> Option<&[u8]>;
}

/// Inputs for creating a [`Session`]
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    pub server_name: Option<String>,
    pub alpn: Option<String>,
    /// Server side only: demand a stateless retry from unverified peers
    pub enforce_cookie: bool,
}

/// Process-wide cryptographic context, shared by every connection of an
/// endpoint
pub trait Engine {
    fn random_bytes(&mut self, output: &mut [u8]);

    /// Stateless-reset token for a connection id, derived as
    /// `SHA-256(reset_seed || cnx_id)` truncated to 16 bytes
    fn reset_token(&self, cnx_id: u64) -> [u8; RESET_SECRET_LEN];

    fn new_session(&mut self, mode: Mode, config: SessionConfig) -> Box<dyn Session>;

    fn random_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    fn random_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }
}
