//! # streamsync
//!
//! An offline-first stream synchronization engine. It keeps a client's view
//! of many server-side event streams up to date over one long-lived
//! subscription.
//!
//! ## Overview
//!
//! - **Bootstrap**: at startup, streams load from local persistence first
//!   and from the network only when needed, in priority order and under a
//!   shared concurrency ceiling.
//! - **Live sync**: one subscription carries every registered stream. Lost
//!   connections are retried with exponential backoff and resumed from
//!   per-stream cookies, so nothing is missed or applied twice.
//! - **Reconciliation**: membership and per-user attributes keep confirmed
//!   state apart from an optimistic pending overlay, and tell listeners
//!   exactly when something changed.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use streamsync::{ClientConfig, SyncClient};
//! use streamsync::store::SqliteStore;
//! use streamsync::sync::transport::memory::ScriptedTransport;
//!
//! async fn example() -> streamsync::Result<()> {
//!     let store = Arc::new(SqliteStore::open("streams.db")?);
//!     let transport = Arc::new(ScriptedTransport::new());
//!     let client = SyncClient::new(transport, store, ClientConfig::default());
//!
//!     let space = streamsync::core::StreamId::space(&[7; 20]);
//!     client.init_streams(vec![space], vec![])?;
//!     client.request_sync();
//!     client.start_bootstrap()?;
//!     client.wait_bootstrapped().await;
//!
//!     for member in client.members(&space).await? {
//!         println!("{} {:?}", member.user_id, member.display_name);
//!     }
//!     client.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `streamsync::core` - identifiers, events, sync state, listeners
//! - `streamsync::state` - stream views and reconcilers
//! - `streamsync::store` - persistence and SQLite
//! - `streamsync::sync` - registry, loader, limiter, transport

pub mod client;
pub mod error;

pub use streamsync_core as core;
pub use streamsync_state as state;
pub use streamsync_store as store;
pub use streamsync_sync as sync;

pub use client::{ClientConfig, SyncClient, SyncClientBuilder};
pub use error::{ClientError, Result};

pub use streamsync_core::{
    InitStatus, NoopListener, StreamId, StreamKind, StreamListener, SyncCookie, SyncState, UserId,
};
pub use streamsync_state::{StreamMember, StreamStateView};
pub use streamsync_sync::{SharedView, SyncRegistry, SyncTransport};
