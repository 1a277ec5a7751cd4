//! Application-facing notifications.
//!
//! Every method has an empty default body: listeners implement only what
//! they care about. Notifications are fire-and-forget and must not block.

use serde::{Deserialize, Serialize};

use crate::status::{InitStatus, SyncState};
use crate::stream::StreamId;
use crate::types::UserId;

/// Per-user attributes tracked alongside membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeKind {
    DisplayName,
    LinkedAddress,
    Nft,
}

/// Receiver for state and sync notifications.
pub trait StreamListener: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Membership
    // ─────────────────────────────────────────────────────────────────────────

    fn on_pending_membership_updated(&self, _stream_id: &StreamId, _user_id: &UserId) {}

    fn on_new_user_joined(&self, _stream_id: &StreamId, _user_id: &UserId) {}

    fn on_new_user_invited(&self, _stream_id: &StreamId, _user_id: &UserId) {}

    fn on_user_left(&self, _stream_id: &StreamId, _user_id: &UserId) {}

    fn on_membership_updated(&self, _stream_id: &StreamId, _user_id: &UserId) {}

    // ─────────────────────────────────────────────────────────────────────────
    // Attributes
    // ─────────────────────────────────────────────────────────────────────────

    fn on_attribute_updated(
        &self,
        _stream_id: &StreamId,
        _kind: AttributeKind,
        _user_id: &UserId,
        _pending: bool,
    ) {
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Engine
    // ─────────────────────────────────────────────────────────────────────────

    fn on_init_status(&self, _status: &InitStatus) {}

    fn on_sync_state_changed(&self, _state: SyncState) {}

    fn on_sync_active(&self, _active: bool) {}

    fn on_stream_removed_from_sync(&self, _stream_id: &StreamId) {}
}

/// A listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl StreamListener for NoopListener {}

/// A listener that records every notification, for tests and diagnostics.
pub mod recording {
    use super::*;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    /// One recorded notification.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Notification {
        PendingMembershipUpdated(StreamId, UserId),
        NewUserJoined(StreamId, UserId),
        NewUserInvited(StreamId, UserId),
        UserLeft(StreamId, UserId),
        MembershipUpdated(StreamId, UserId),
        AttributeUpdated {
            stream_id: StreamId,
            kind: AttributeKind,
            user_id: UserId,
            pending: bool,
        },
        InitStatus(InitStatus),
        SyncStateChanged(SyncState),
        SyncActive(bool),
        StreamRemovedFromSync(StreamId),
    }

    /// Collects notifications in arrival order.
    #[derive(Debug, Default)]
    pub struct RecordingListener {
        events: Mutex<Vec<Notification>>,
    }

    impl RecordingListener {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, Vec<Notification>> {
            self.events.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn push(&self, n: Notification) {
            self.lock().push(n);
        }

        /// Everything recorded so far.
        pub fn events(&self) -> Vec<Notification> {
            self.lock().clone()
        }

        /// Number of recorded notifications matching `pred`.
        pub fn count(&self, pred: impl Fn(&Notification) -> bool) -> usize {
            self.lock().iter().filter(|n| pred(n)).count()
        }

        /// Sync states in the order they were entered.
        pub fn sync_states(&self) -> Vec<SyncState> {
            self.lock()
                .iter()
                .filter_map(|n| match n {
                    Notification::SyncStateChanged(s) => Some(*s),
                    _ => None,
                })
                .collect()
        }

        /// Init statuses in emission order.
        pub fn init_statuses(&self) -> Vec<InitStatus> {
            self.lock()
                .iter()
                .filter_map(|n| match n {
                    Notification::InitStatus(s) => Some(*s),
                    _ => None,
                })
                .collect()
        }

        pub fn clear(&self) {
            self.lock().clear();
        }
    }

    impl StreamListener for RecordingListener {
        fn on_pending_membership_updated(&self, stream_id: &StreamId, user_id: &UserId) {
            self.push(Notification::PendingMembershipUpdated(*stream_id, *user_id));
        }

        fn on_new_user_joined(&self, stream_id: &StreamId, user_id: &UserId) {
            self.push(Notification::NewUserJoined(*stream_id, *user_id));
        }

        fn on_new_user_invited(&self, stream_id: &StreamId, user_id: &UserId) {
            self.push(Notification::NewUserInvited(*stream_id, *user_id));
        }

        fn on_user_left(&self, stream_id: &StreamId, user_id: &UserId) {
            self.push(Notification::UserLeft(*stream_id, *user_id));
        }

        fn on_membership_updated(&self, stream_id: &StreamId, user_id: &UserId) {
            self.push(Notification::MembershipUpdated(*stream_id, *user_id));
        }

        fn on_attribute_updated(
            &self,
            stream_id: &StreamId,
            kind: AttributeKind,
            user_id: &UserId,
            pending: bool,
        ) {
            self.push(Notification::AttributeUpdated {
                stream_id: *stream_id,
                kind,
                user_id: *user_id,
                pending,
            });
        }

        fn on_init_status(&self, status: &InitStatus) {
            self.push(Notification::InitStatus(*status));
        }

        fn on_sync_state_changed(&self, state: SyncState) {
            self.push(Notification::SyncStateChanged(state));
        }

        fn on_sync_active(&self, active: bool) {
            self.push(Notification::SyncActive(active));
        }

        fn on_stream_removed_from_sync(&self, stream_id: &StreamId) {
            self.push(Notification::StreamRemovedFromSync(*stream_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::recording::{Notification, RecordingListener};
    use super::*;

    #[test]
    fn test_recording_listener_counts() {
        let listener = RecordingListener::new();
        let stream = StreamId::space(&[1; 20]);
        let user = UserId::from_bytes([2; 20]);

        listener.on_new_user_joined(&stream, &user);
        listener.on_membership_updated(&stream, &user);
        listener.on_sync_state_changed(SyncState::Starting);

        assert_eq!(listener.events().len(), 3);
        assert_eq!(
            listener.count(|n| matches!(n, Notification::NewUserJoined(..))),
            1
        );
        assert_eq!(listener.sync_states(), vec![SyncState::Starting]);

        listener.clear();
        assert!(listener.events().is_empty());
    }

    #[test]
    fn test_noop_listener_accepts_everything() {
        let listener = NoopListener;
        listener.on_sync_active(true);
        listener.on_init_status(&InitStatus::default());
    }
}
