//! Error types for the client.

use streamsync_core::{CoreError, StreamId};
use streamsync_state::StateError;
use streamsync_store::StoreError;
use streamsync_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Stream not registered with the client.
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
