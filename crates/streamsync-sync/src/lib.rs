//! # streamsync sync
//!
//! The live side of the engine.
//!
//! - [`SyncRegistry`] owns the stream map and drives the subscription state
//!   machine: push loop, backoff and resubscription, keepalive, stop.
//! - [`BootstrapLoader`] fills the registry at startup from persistence and
//!   the network, then starts sync.
//! - [`ConcurrencyLimiter`] bounds bulk and ad hoc loads.
//! - [`SyncTransport`] is the RPC seam; [`transport::memory`] scripts it for
//!   tests.

pub mod backoff;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod limiter;
pub mod messages;
pub mod registry;
pub mod transport;

pub use backoff::{backoff_wait, retry_delay, stream_down_delay, WaitOutcome};
pub use bootstrap::{priority, BootstrapLoader, LoadCounters};
pub use config::{BootstrapConfig, SyncConfig};
pub use error::{ErrorClass, Result, SyncError};
pub use keepalive::{Keepalive, KeepaliveAction, NonceStats};
pub use limiter::ConcurrencyLimiter;
pub use messages::{StreamUpdate, SyncOp, SyncResponse};
pub use registry::{SharedView, SyncRegistry, SyncStats};
pub use transport::{ResponseStream, SyncTransport};
