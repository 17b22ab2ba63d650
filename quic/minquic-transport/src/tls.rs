// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! TLS adapter
//!
//! Owns the cryptographic session for one connection and drives it with
//! contiguous stream-0 bytes. The adapter injects the local
//! transport-parameter extension, surfaces the peer's set, and installs
//! the AEAD contexts when the handshake reaches 1-RTT.

use crate::{
    connection::{Connection, State},
    stream::Stream,
};
use alloc::{boxed::Box, vec::Vec};
use minquic_codec::EncoderBuffer;
use minquic_core::{
    crypto::{label, Engine, HandshakeStatus, Mode, Session, SessionConfig},
    time::Timestamp,
    transport::{Error, TransportParameters},
};

pub(crate) struct TlsAdapter {
    session: Box<dyn Session>,
    mode: Mode,
    // kept so a stateless retry can restart from scratch
    config: SessionConfig,
}

fn encode_parameters(params: &TransportParameters) -> Vec<u8> {
    let mut storage = [0u8; 256];
    let mut encoder = EncoderBuffer::new(&mut storage);
    params
        .encode(&mut encoder)
        .expect("parameter extension fits any packet");
    encoder.as_written().to_vec()
}

impl TlsAdapter {
    pub fn new(
        engine: &mut dyn Engine,
        mode: Mode,
        config: SessionConfig,
        local_parameters: &TransportParameters,
    ) -> Self {
        let mut session = engine.new_session(mode, config.clone());
        session.set_transport_parameters(encode_parameters(local_parameters));
        Self {
            session,
            mode,
            config,
        }
    }

    /// Replaces the session, as the fresh server-init round after an HRR
    /// and client version renegotiation require
    pub fn restart(&mut self, engine: &mut dyn Engine, local_parameters: &TransportParameters) {
        self.session = engine.new_session(self.mode, self.config.clone());
        self.session
            .set_transport_parameters(encode_parameters(local_parameters));
    }

    /// Client-side kick-off: produces the first flight with no input
    pub fn start(&mut self, stream_zero: &mut Stream) -> Result<(), Error> {
        let result = self
            .session
            .handshake(&[])
            .map_err(|failure| Error::new(Error::PROTOCOL_VIOLATION, failure.reason))?;
        if !result.output.is_empty() {
            stream_zero.enqueue(&result.output, false);
        }
        Ok(())
    }

    pub fn session(&self) -> &dyn Session {
        &*self.session
    }

    pub fn session_mut(&mut self) -> &mut dyn Session {
        &mut *self.session
    }

    pub fn peer_transport_parameters(&self) -> Option<Vec<u8>> {
        self.session.peer_transport_parameters().map(<[u8]>::to_vec)
    }

    pub fn negotiated_protocol(&self) -> Option<&str> {
        self.session.negotiated_protocol()
    }

    pub fn server_name(&self) -> Option<&str> {
        self.session.server_name()
    }
}

impl Connection {
    /// Feeds every contiguous stream-0 byte to the session, queues the
    /// produced flights, and advances the connection state machine on
    /// handshake milestones.
    pub(crate) fn drive_tls(&mut self, _now: Timestamp) -> Result<(), Error> {
        while let Some((bytes, _fin)) = self.stream_zero.deliverable() {
            if bytes.is_empty() {
                break;
            }

            let result = self
                .tls
                .session_mut()
                .handshake(&bytes)
                .map_err(|failure| Error::new(Error::PROTOCOL_VIOLATION, failure.reason))?;

            match result.status {
                HandshakeStatus::InProgress => {
                    if self.state == State::ClientHrrReceived {
                        // the retry flight restarts the transport: queued
                        // retransmissions die and stream 0 starts over
                        self.retransmit.clear();
                        self.bytes_in_transit = 0;
                        self.stream_zero.reset_transfer_state();
                        self.state = State::ClientInit;
                    } else if self.state == State::ClientHandshakeStart {
                        self.state = State::ClientHandshakeProgress;
                    }
                }
                HandshakeStatus::StatelessRetry => {
                    self.state = State::ServerSendHrr;
                }
                HandshakeStatus::Complete => {
                    self.on_handshake_complete()?;
                }
            }

            if !result.output.is_empty() {
                self.stream_zero.enqueue(&result.output, false);
            }
        }
        Ok(())
    }

    fn on_handshake_complete(&mut self) -> Result<(), Error> {
        let body = self.tls.peer_transport_parameters().ok_or(Error::new(
            Error::TRANSPORT_PARAMETER_ERROR,
            "peer sent no transport parameters",
        ))?;
        let params = TransportParameters::decode(&body, self.is_client)?;
        self.apply_remote_parameters(params);

        match self.state {
            State::ClientInit
            | State::ClientInitSent
            | State::ClientInitResent
            | State::ClientHandshakeStart
            | State::ClientHandshakeProgress => {
                self.state = State::ClientAlmostReady;
                self.setup_one_rtt_keys(false)?;
            }
            State::ServerInit => {
                self.state = State::ServerAlmostReady;
                self.setup_one_rtt_keys(true)?;
            }
            // late flights (e.g. the client's Finished arriving at a
            // server that already completed) change nothing
            _ => {}
        }
        Ok(())
    }

    fn setup_one_rtt_keys(&mut self, is_server: bool) -> Result<(), Error> {
        let (seal_label, open_label) = if is_server {
            (label::ONE_RTT_SERVER, label::ONE_RTT_CLIENT)
        } else {
            (label::ONE_RTT_CLIENT, label::ONE_RTT_SERVER)
        };

        let session = self.tls.session();
        let key_error = Error::new(Error::PROTOCOL_VIOLATION, "traffic secret unavailable");

        let seal_secret = session.export_secret(seal_label).ok_or(key_error)?;
        let open_secret = session.export_secret(open_label).ok_or(key_error)?;

        self.aead_encrypt = Some(session.new_key(&seal_secret));
        // opener over our own traffic secret, to recognise echoed packets
        self.aead_de_encrypt = Some(session.new_key(&seal_secret));
        self.aead_decrypt = Some(session.new_key(&open_secret));

        tracing::debug!(handle = self.handle.0, is_server, "1-RTT keys installed");
        Ok(())
    }
}
