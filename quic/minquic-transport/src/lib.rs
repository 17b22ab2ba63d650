// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection and endpoint state machines for the minquic transport
//!
//! The crate is sans-I/O and single threaded: an embedder owns the UDP
//! sockets and the clock, and drives an [`endpoint::Endpoint`] through
//! three entry points: `incoming`, `prepare_packet` and
//! `next_wake_delay`. Everything else (handshake, reassembly, loss
//! recovery, flow control) happens inside those calls.
//!
//! Like the core crate this one is `no_std` plus `alloc`; addresses and
//! durations come from `core::net` and `core::time`. The `std` feature
//! adds the `std::error::Error` impl for [`LocalError`].

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

pub mod congestion;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod limits;
mod sender;
pub mod stream;
pub mod testing;
mod tls;

pub use connection::{Connection, ConnectionHandle, State};
pub use endpoint::Endpoint;
pub use error::LocalError;
pub use stream::CallbackEvent;
