//! # streamsync state
//!
//! Reconciled per-stream state. A [`StreamStateView`] merges a snapshot with
//! ordered confirmed miniblocks and the pending minipool, and keeps the
//! membership and per-user attribute reconcilers in step.
//!
//! ## Reconciliation pattern
//!
//! Every per-user reconciler keeps confirmed state separate from an
//! optimistic pending overlay. Pending entries are indexed by event id so
//! confirmation can replay them, and are dropped once confirmed. Applying
//! the same confirmed event twice changes nothing and notifies once.

pub mod attributes;
pub mod decrypt;
pub mod error;
pub mod membership;
pub mod view;

pub use attributes::{AttributeInfo, DisplayName, UserAttributeReconciler};
pub use decrypt::Decryptor;
pub use error::{Result, StateError};
pub use membership::MembershipReconciler;
pub use view::{ApplyOutcome, DecryptionRequest, PersistedStream, StreamMember, StreamStateView};
