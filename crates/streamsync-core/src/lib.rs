//! # streamsync core
//!
//! Pure data model for the stream synchronization engine: identifiers,
//! events, resumption cookies, the sync state table and the notification
//! surface.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`StreamId`] - 32-byte stream identifier whose prefix gives its [`StreamKind`]
//! - [`SyncCookie`] - Per-stream resumption token
//! - [`StreamEvent`] - A content-addressed event ([`EventId`])
//! - [`SyncState`] - State of the live subscription, with its transition table
//! - [`StreamListener`] - Fire-and-forget notifications for applications

pub mod error;
pub mod event;
pub mod notify;
pub mod status;
pub mod stream;
pub mod types;

pub use error::{CoreError, Result};
pub use event::{
    Confirmation, EncryptedData, EventPayload, MembershipOp, MiniblockHeader, NftBadge,
    SnapshotMember, StreamEvent, StreamSnapshot,
};
pub use notify::{AttributeKind, NoopListener, StreamListener};
pub use status::{InitStatus, SyncState};
pub use stream::{StreamId, StreamKind, SyncCookie, STREAM_ID_LEN};
pub use types::{EventId, SyncId, UserId};
