//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A persisted stream could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// The blocking worker panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(String),

    /// Injected by test doubles.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
