// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Errors surfaced synchronously to the embedder
//!
//! These never appear on the wire; peer-visible failures use
//! [`minquic_core::transport::Error`] and travel in CONNECTION_CLOSE.

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalError {
    /// The referenced connection handle is not registered
    UnknownConnection,
    /// The operation is not allowed on stream 0
    StreamZeroReserved,
    /// The referenced stream id is outside the negotiated limit
    InvalidStreamId,
    /// The stream's sending side was already finished or reset
    StreamAlreadyClosed,
    /// The connection is not in a state that allows the operation
    Disconnected,
    /// The connection id is already bound to another connection
    DuplicateConnectionId,
}

impl fmt::Display for LocalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason = match self {
            LocalError::UnknownConnection => "unknown connection",
            LocalError::StreamZeroReserved => "stream 0 is reserved for the handshake",
            LocalError::InvalidStreamId => "invalid stream id",
            LocalError::StreamAlreadyClosed => "stream already closed",
            LocalError::Disconnected => "connection is disconnected",
            LocalError::DuplicateConnectionId => "connection id already registered",
        };
        f.write_str(reason)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LocalError {}
