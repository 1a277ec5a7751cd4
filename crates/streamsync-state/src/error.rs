//! Error types for stream state reconciliation.

use streamsync_core::{CoreError, EventId, StreamId, UserId};
use thiserror::Error;

/// Errors raised while applying events to a stream view.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("{user_id} is not a member of stream {stream_id}")]
    NotAMember { stream_id: StreamId, user_id: UserId },

    #[error("unknown event: {0}")]
    UnknownEvent(EventId),

    #[error("plaintext for {event_id} is not valid utf-8")]
    InvalidPlaintext { event_id: EventId },

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for state operations.
pub type Result<T> = std::result::Result<T, StateError>;
