// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Raises the peer's flow control limit for one stream, in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxStreamData {
    pub stream_id: u32,
    pub maximum_stream_data: u64,
}

fixed_frame_codec!(
    MaxStreamData,
    crate::frame::TAG_MAX_STREAM_DATA,
    [stream_id: u32, maximum_stream_data: u64]
);
