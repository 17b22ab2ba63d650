// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire-level types for the minquic transport: integer and time codecs,
//! packet headers, frames, transport parameters, acknowledgement state and
//! the cryptographic engine contract.
//!
//! Nothing in this crate owns connection state; that lives in
//! `minquic-transport`.
//!
//! The crate is `no_std`, but requires `alloc`: frames and handshake
//! flights own their byte buffers. The `std` feature only restores the
//! standard prelude for embedders that want it.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

pub mod crypto;
pub mod float16;
pub mod fnv1a;
pub mod frame;
pub mod packet;
pub mod sack;
pub mod time;
pub mod transport;

/// Version used by the very first cross-implementation interop runs
pub const FIRST_INTEROP_VERSION: u32 = 0xff00_0005;

/// Version reserved for internal testing
pub const INTERNAL_TEST_VERSION_1: u32 = 0x5043_5130;

/// Supported versions, preferred first. Version negotiation responses list
/// them in this order and clients created without an explicit preference
/// propose the first entry.
pub const SUPPORTED_VERSIONS: &[u32] = &[FIRST_INTEROP_VERSION, INTERNAL_TEST_VERSION_1];

pub fn is_supported_version(version: u32) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}
