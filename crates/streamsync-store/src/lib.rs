//! # streamsync store
//!
//! Persistence for stream views behind the [`Persistence`] trait, with
//! [`SqliteStore`] as the durable backend and [`MemoryStore`] for tests.
//!
//! Views are stored as the CBOR encoding of a
//! [`PersistedStream`](streamsync_state::PersistedStream) and rebuilt by
//! replay on load, so the stored cookie always matches the stored events.

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::Persistence;
