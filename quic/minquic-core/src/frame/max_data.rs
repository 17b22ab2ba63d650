// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Raises the peer's connection-wide flow control limit, in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxData {
    pub maximum_data: u64,
}

fixed_frame_codec!(MaxData, crate::frame::TAG_MAX_DATA, [maximum_data: u64]);
