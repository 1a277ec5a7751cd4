//! Error types for the sync module.

use streamsync_core::{StreamId, SyncState};
use thiserror::Error;

/// How the engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A bug in the caller. Fails loudly, never retried.
    Programmer,
    /// Connection trouble. Retried with backoff and resubscription.
    Transient,
    /// Rejected by the server. Stops sync and reaches the caller.
    Terminal,
}

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The transport dropped or failed a call.
    #[error("transport error: {0}")]
    Transport(String),

    /// A call did not complete in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// No pong arrived before the keepalive deadline.
    #[error("missed pong for nonce {nonce}")]
    MissedPong { nonce: String },

    /// The server ended the subscription on its own.
    #[error("server closed the subscription")]
    ServerClosed,

    /// The server rejected a resumption cookie.
    #[error("bad sync cookie: {0}")]
    BadSyncCookie(String),

    /// The server refused the client.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The server does not know the stream.
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    /// Requested sync state change is not in the transition table.
    #[error("invalid sync state transition: {from} -> {to}")]
    InvalidTransition { from: SyncState, to: SyncState },

    /// A one-time initializer was called twice.
    #[error("{0} already initialized")]
    AlreadyInitialized(&'static str),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] streamsync_store::StoreError),

    #[error("state error: {0}")]
    State(#[from] streamsync_state::StateError),

    #[error("core error: {0}")]
    Core(#[from] streamsync_core::CoreError),
}

impl SyncError {
    /// Map the error onto the engine's error classes.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Transport(_)
            | SyncError::Timeout(_)
            | SyncError::MissedPong { .. }
            | SyncError::ServerClosed
            | SyncError::Store(_) => ErrorClass::Transient,

            SyncError::BadSyncCookie(_)
            | SyncError::Unauthorized(_)
            | SyncError::StreamNotFound(_)
            | SyncError::Cancelled
            | SyncError::State(_)
            | SyncError::Core(_) => ErrorClass::Terminal,

            SyncError::InvalidTransition { .. } | SyncError::AlreadyInitialized(_) => {
                ErrorClass::Programmer
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(SyncError::Transport("reset".into()).is_retryable());
        assert!(SyncError::MissedPong { nonce: "n".into() }.is_retryable());
        assert!(SyncError::ServerClosed.is_retryable());
        assert_eq!(
            SyncError::Unauthorized("nope".into()).class(),
            ErrorClass::Terminal
        );
        assert_eq!(
            SyncError::BadSyncCookie("stale".into()).class(),
            ErrorClass::Terminal
        );
        assert_eq!(
            SyncError::AlreadyInitialized("stream ids").class(),
            ErrorClass::Programmer
        );
    }
}
