// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Raises the highest stream id the peer may open
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxStreamId {
    pub maximum_stream_id: u32,
}

fixed_frame_codec!(
    MaxStreamId,
    crate::frame::TAG_MAX_STREAM_ID,
    [maximum_stream_id: u32]
);
