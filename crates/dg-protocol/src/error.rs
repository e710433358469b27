//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding a channel-request payload
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// A field runs past the end of the payload
    #[error("Truncated {field}: need {needed} bytes, {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    /// A string field is not valid UTF-8
    #[error("Invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    /// A request that must carry no payload carried one
    #[error("Unexpected {len} byte payload for {kind} request")]
    UnexpectedPayload { kind: &'static str, len: usize },
}
