// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Frames a sender uses to signal that a flow-control or stream-id limit
//! is holding back data it wants to send

/// The connection-wide `maxdata` limit was reached
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Blocked {}

fixed_frame_codec!(Blocked, crate::frame::TAG_BLOCKED, []);

/// A per-stream `max_stream_data` limit was reached
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamBlocked {
    pub stream_id: u32,
}

fixed_frame_codec!(StreamBlocked, crate::frame::TAG_STREAM_BLOCKED, [stream_id: u32]);

/// The peer's `max_stream_id` limit prevents opening a new stream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamIdNeeded {}

fixed_frame_codec!(StreamIdNeeded, crate::frame::TAG_STREAM_ID_NEEDED, []);
