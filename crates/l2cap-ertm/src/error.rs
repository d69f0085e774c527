//! Error types for wire-level decoding
//!
//! Everything that can go wrong while turning bytes into frames lands here.
//! A `CodecError` is never fatal to a channel: the caller logs it and drops
//! the offending PDU.

use thiserror::Error;

/// Errors raised while decoding ACL packets, L2CAP frames or signaling commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("{what} too short: need {needed} bytes, got {actual}")]
    TooShort {
        what: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("declared length {declared} does not match {actual} available bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("FCS mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    FcsMismatch { received: u16, computed: u16 },

    #[error("malformed configuration option type {option_type:#04x}")]
    MalformedOption { option_type: u8 },

    #[error("invalid ACL header: {0}")]
    InvalidAclHeader(&'static str),

    #[error("invalid signaling command {code:#04x}: {reason}")]
    InvalidCommand { code: u8, reason: &'static str },
}

impl CodecError {
    pub(crate) fn too_short(what: &'static str, needed: usize, actual: usize) -> Self {
        Self::TooShort {
            what,
            needed,
            actual,
        }
    }
}
