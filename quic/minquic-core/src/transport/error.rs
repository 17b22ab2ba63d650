// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Peer-visible transport error codes
//!
//! These are the u32 codes carried in CONNECTION_CLOSE and RST_STREAM
//! frames. Local API misuse never maps to one of these; it stays on the
//! caller's side of the boundary.

use core::fmt;
use minquic_codec::DecoderError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Error {
    pub code: u32,
    pub reason: &'static str,
}

impl Error {
    pub const fn new(code: u32, reason: &'static str) -> Self {
        Self { code, reason }
    }

    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }

    /// Code for a malformed or unprocessable frame of type `tag`
    pub const fn frame_error(tag: u8) -> Self {
        Self::new(Self::FRAME_ERROR_MIN | tag as u32, "")
    }
}

/// Internal convenience macro for defining standard error codes
macro_rules! def_error {
    ($doc:expr, $name:ident, $code:expr) => {
        impl Error {
            #[doc = $doc]
            pub const $name: u32 = $code;
        }
    };
}

def_error!(
    "The connection is being closed abruptly in the absence of any error.",
    NO_ERROR,
    0x8000_0000
);
def_error!(
    "The endpoint encountered an internal error and cannot continue.",
    INTERNAL,
    0x8000_0001
);
def_error!(
    "The endpoint is no longer interested in the stream data (RST_STREAM only).",
    CANCELLED,
    0x8000_0002
);
def_error!(
    "The peer sent more data than its advertised flow control limits allow.",
    FLOW_CONTROL_ERROR,
    0x8000_0003
);
def_error!(
    "A frame referenced a stream id outside the advertised limit.",
    STREAM_ID_ERROR,
    0x8000_0004
);
def_error!(
    "A frame arrived for a stream in a state that does not permit it.",
    STREAM_STATE_ERROR,
    0x8000_0005
);
def_error!(
    "Stream data contradicted an already established final offset.",
    FINAL_OFFSET_ERROR,
    0x8000_0006
);
def_error!(
    "A frame was badly formatted.",
    FRAME_FORMAT_ERROR,
    0x8000_0007
);
def_error!(
    "The transport parameter extension was malformed or illegal.",
    TRANSPORT_PARAMETER_ERROR,
    0x8000_0008
);
def_error!(
    "Version negotiation failed or was spoofed.",
    VERSION_NEGOTIATION_ERROR,
    0x8000_0009
);
def_error!(
    "A protocol rule not covered by a more specific code was violated.",
    PROTOCOL_VIOLATION,
    0x8000_000a
);

impl Error {
    /// Low bound of the per-frame-type error range; the frame tag is
    /// OR-ed into the low byte
    pub const FRAME_ERROR_MIN: u32 = 0x8000_0100;
    pub const FRAME_ERROR_MAX: u32 = 0x8000_01ff;
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "TransportError({:#010x})", self.code)
        } else {
            write!(f, "{} ({:#010x})", self.reason, self.code)
        }
    }
}

impl From<DecoderError> for Error {
    fn from(error: DecoderError) -> Self {
        match error {
            DecoderError::InvariantViolation(reason) => {
                Self::new(Self::PROTOCOL_VIOLATION, reason)
            }
            DecoderError::UnexpectedEof => {
                Self::new(Self::FRAME_FORMAT_ERROR, "truncated encoding")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_error_embeds_the_tag() {
        let error = Error::frame_error(0x0c);
        assert_eq!(error.code, 0x8000_010c);
        assert!(error.code >= Error::FRAME_ERROR_MIN);
        assert!(error.code <= Error::FRAME_ERROR_MAX);
    }

    #[test]
    fn display_formats() {
        assert_eq!(
            Error::new(Error::NO_ERROR, "").to_string(),
            "TransportError(0x80000000)"
        );
        assert_eq!(
            Error::new(Error::FLOW_CONTROL_ERROR, "maxdata exceeded").to_string(),
            "maxdata exceeded (0x80000003)"
        );
    }
}
