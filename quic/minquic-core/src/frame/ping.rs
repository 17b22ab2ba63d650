// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Solicits an acknowledgement without carrying any payload
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ping {}

fixed_frame_codec!(Ping, crate::frame::TAG_PING, []);
