// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Endpoint-level configuration
//!
//! The limits feed both the advertised transport parameters and the
//! pre-handshake assumptions about the peer, exactly mirroring what the
//! parameter exchange can later overwrite.

use minquic_core::transport::TransportParameters;

#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Per-stream flow control limit advertised to the peer, bytes
    pub initial_max_stream_data: u32,
    /// Connection-wide flow control limit advertised to the peer, KiB
    pub initial_max_data: u32,
    /// Highest stream id the peer may open
    pub initial_max_stream_id: u32,
    /// Silence tolerated before the connection is abandoned, seconds
    pub idle_timeout: u16,
    /// Ask the peer to omit the connection id from short headers
    pub omit_connection_id: bool,
    pub max_packet_size: u16,
}

impl Default for Limits {
    fn default() -> Self {
        let params = TransportParameters::default();
        Self {
            initial_max_stream_data: params.initial_max_stream_data,
            initial_max_data: params.initial_max_data,
            initial_max_stream_id: params.initial_max_stream_id,
            idle_timeout: params.idle_timeout,
            omit_connection_id: params.omit_connection_id,
            max_packet_size: params.max_packet_size,
        }
    }
}

impl Limits {
    /// Parameter set advertised during the handshake. The stateless reset
    /// token is filled in per connection by the server.
    pub(crate) fn to_parameters(self) -> TransportParameters {
        TransportParameters {
            initial_max_stream_data: self.initial_max_stream_data,
            initial_max_data: self.initial_max_data,
            initial_max_stream_id: self.initial_max_stream_id,
            idle_timeout: self.idle_timeout,
            omit_connection_id: self.omit_connection_id,
            max_packet_size: self.max_packet_size,
            stateless_reset_token: None,
        }
    }
}
