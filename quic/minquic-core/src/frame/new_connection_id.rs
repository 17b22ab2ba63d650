// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Supplies an additional connection id the peer may use to address this
/// connection, e.g. after a rebinding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewConnectionId {
    pub sequence: u16,
    pub cnx_id: u64,
}

fixed_frame_codec!(
    NewConnectionId,
    crate::frame::TAG_NEW_CONNECTION_ID,
    [sequence: u16, cnx_id: u64]
);
