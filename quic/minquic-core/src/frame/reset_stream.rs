// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Abruptly terminates the sending side of a stream. The final offset lets
/// the receiver reconcile connection-level flow control accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetStream {
    pub stream_id: u32,
    pub error_code: u32,
    pub final_offset: u64,
}

fixed_frame_codec!(
    ResetStream,
    crate::frame::TAG_RST_STREAM,
    [stream_id: u32, error_code: u32, final_offset: u64]
);
