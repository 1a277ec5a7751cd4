//! # streamsync testkit
//!
//! Testing utilities for streamsync.
//!
//! - **Fixtures**: deterministic ids, events and snapshots, plus a
//!   [`TestFixture`] that bundles a scripted transport, a recording
//!   listener and a [`ScriptedPersistence`].
//! - **Generators**: proptest strategies for ids and membership sequences.
//!
//! ```rust
//! use streamsync_testkit::fixtures::{self, TestFixture};
//!
//! let fixture = TestFixture::new();
//! let space = fixtures::space(1);
//! let join = fixtures::join(fixtures::user(7));
//! assert!(fixture.store.loads().is_empty());
//! # let _ = (space, join);
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{ScriptedPersistence, TestFixture};
pub use generators::{membership_step, MembershipStep};
