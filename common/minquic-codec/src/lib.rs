// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Panic-free encoding and decoding buffers for untrusted network input

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]

pub mod decoder;
pub mod encoder;

pub use decoder::{DecoderBuffer, DecoderBufferResult, DecoderError};
pub use encoder::{EncoderBuffer, EncoderError, EncoderResult};
