//! Decryption service seam.

use async_trait::async_trait;
use streamsync_core::StreamId;

use crate::error::Result;

/// Turns ciphertext into plaintext. Reconciliation treats payloads as
/// opaque bytes until this returns.
#[async_trait]
pub trait Decryptor: Send + Sync {
    async fn decrypt(
        &self,
        stream_id: &StreamId,
        session_id: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;
}

/// In-memory decryptor for tests.
pub mod memory {
    use super::*;
    use crate::error::StateError;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns the ciphertext unchanged, except for sessions marked as
    /// missing keys.
    #[derive(Debug, Default)]
    pub struct PassthroughDecryptor {
        missing_sessions: HashSet<String>,
        calls: AtomicUsize,
    }

    impl PassthroughDecryptor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail every request for `session_id`.
        pub fn with_missing_session(mut self, session_id: impl Into<String>) -> Self {
            self.missing_sessions.insert(session_id.into());
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Decryptor for PassthroughDecryptor {
        async fn decrypt(
            &self,
            _stream_id: &StreamId,
            session_id: &str,
            ciphertext: &[u8],
        ) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.missing_sessions.contains(session_id) {
                return Err(StateError::Decryption(format!(
                    "no key for session {}",
                    session_id
                )));
            }
            Ok(ciphertext.to_vec())
        }
    }
}
