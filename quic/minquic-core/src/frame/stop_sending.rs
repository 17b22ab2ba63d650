// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Asks the peer to stop transmitting on a stream, typically answered with
/// a RST_STREAM
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopSending {
    pub stream_id: u32,
    pub error_code: u32,
}

fixed_frame_codec!(
    StopSending,
    crate::frame::TAG_STOP_SENDING,
    [stream_id: u32, error_code: u32]
);
