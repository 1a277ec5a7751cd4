//! Error types for streamsync core.

use thiserror::Error;

/// Errors raised by the pure data model.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid stream id: {0}")]
    InvalidStreamId(String),

    #[error("unknown membership op: {0}")]
    UnknownMembershipOp(i32),

    #[error("event id mismatch: expected {expected}, got {actual}")]
    EventIdMismatch { expected: String, actual: String },

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
