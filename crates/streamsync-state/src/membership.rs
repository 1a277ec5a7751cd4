//! Membership reconciliation.
//!
//! Confirmed membership is kept in three mutually exclusive sets (joined,
//! invited, left). Pending events form an optimistic overlay on top of it
//! that is cleared when the matching event is confirmed. Pending entries
//! are never authoritative.

use std::collections::{HashMap, HashSet};

use streamsync_core::{Confirmation, EventId, MembershipOp, StreamId, StreamListener, UserId};

/// Membership state of one stream.
#[derive(Debug, Clone)]
pub struct MembershipReconciler {
    stream_id: StreamId,

    joined: HashSet<UserId>,
    invited: HashSet<UserId>,
    left: HashSet<UserId>,

    pending_joined: HashSet<UserId>,
    pending_invited: HashSet<UserId>,
    pending_left: HashSet<UserId>,

    /// Pending membership events by id, replayed on confirmation.
    pending_events: HashMap<EventId, (UserId, MembershipOp)>,
}

impl MembershipReconciler {
    /// Create an empty reconciler for `stream_id`.
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            joined: HashSet::new(),
            invited: HashSet::new(),
            left: HashSet::new(),
            pending_joined: HashSet::new(),
            pending_invited: HashSet::new(),
            pending_left: HashSet::new(),
            pending_events: HashMap::new(),
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Apply one membership operation.
    ///
    /// Pending operations only touch the overlay. Confirmed operations move
    /// the user between the confirmed sets and clear the matching pending
    /// entry. Notifications fire only when a set actually changes, so
    /// re-applying the same event is a no-op.
    pub fn apply_membership_event(
        &mut self,
        user_id: UserId,
        op: MembershipOp,
        confirmation: Confirmation,
        notifier: Option<&dyn StreamListener>,
    ) {
        let stream_id = self.stream_id;
        match (op, confirmation) {
            (MembershipOp::Unspecified, _) => {}

            (MembershipOp::Invite, Confirmation::Pending) => {
                if self.pending_invited.insert(user_id) {
                    notify(notifier, |l| l.on_pending_membership_updated(&stream_id, &user_id));
                }
            }
            (MembershipOp::Join, Confirmation::Pending) => {
                if self.pending_joined.insert(user_id) {
                    notify(notifier, |l| l.on_pending_membership_updated(&stream_id, &user_id));
                }
            }
            (MembershipOp::Leave, Confirmation::Pending) => {
                if self.pending_left.insert(user_id) {
                    notify(notifier, |l| l.on_pending_membership_updated(&stream_id, &user_id));
                }
            }

            (MembershipOp::Invite, Confirmation::Confirmed) => {
                self.pending_invited.remove(&user_id);
                self.joined.remove(&user_id);
                self.left.remove(&user_id);
                if self.invited.insert(user_id) {
                    notify(notifier, |l| {
                        l.on_new_user_invited(&stream_id, &user_id);
                        l.on_membership_updated(&stream_id, &user_id);
                    });
                }
            }
            (MembershipOp::Join, Confirmation::Confirmed) => {
                self.pending_joined.remove(&user_id);
                self.invited.remove(&user_id);
                self.left.remove(&user_id);
                if self.joined.insert(user_id) {
                    notify(notifier, |l| {
                        l.on_new_user_joined(&stream_id, &user_id);
                        l.on_membership_updated(&stream_id, &user_id);
                    });
                }
            }
            (MembershipOp::Leave, Confirmation::Confirmed) => {
                let was_joined = self.joined.remove(&user_id);
                let was_invited = self.invited.remove(&user_id);
                self.pending_left.remove(&user_id);
                self.left.insert(user_id);
                if was_joined || was_invited {
                    notify(notifier, |l| {
                        l.on_user_left(&stream_id, &user_id);
                        l.on_membership_updated(&stream_id, &user_id);
                    });
                }
            }
        }
    }

    /// Record a pending membership event so it can be replayed on
    /// confirmation. Appending an event id twice is a no-op.
    pub fn append_pending(
        &mut self,
        event_id: EventId,
        user_id: UserId,
        op: MembershipOp,
        notifier: Option<&dyn StreamListener>,
    ) {
        if self.pending_events.contains_key(&event_id) {
            return;
        }
        self.pending_events.insert(event_id, (user_id, op));
        self.apply_membership_event(user_id, op, Confirmation::Pending, notifier);
    }

    /// Confirm a previously appended pending event.
    ///
    /// Returns false when the event id was never seen as pending; the
    /// caller then applies the event as confirmed directly.
    pub fn confirm(&mut self, event_id: &EventId, notifier: Option<&dyn StreamListener>) -> bool {
        match self.pending_events.remove(event_id) {
            Some((user_id, op)) => {
                self.apply_membership_event(user_id, op, Confirmation::Confirmed, notifier);
                true
            }
            None => false,
        }
    }

    /// Whether `user_id` is in the confirmed state named by `op`.
    ///
    /// For `Leave` this means "neither joined nor invited", which also holds
    /// for users that were never members at all.
    pub fn is_member(&self, op: MembershipOp, user_id: &UserId) -> bool {
        match op {
            MembershipOp::Invite => self.invited.contains(user_id),
            MembershipOp::Join => self.joined.contains(user_id),
            MembershipOp::Leave => {
                !self.invited.contains(user_id) && !self.joined.contains(user_id)
            }
            MembershipOp::Unspecified => false,
        }
    }

    /// Joined, either confirmed or optimistically.
    pub fn is_joined_or_pending(&self, user_id: &UserId) -> bool {
        (self.joined.contains(user_id) || self.pending_joined.contains(user_id))
            && !self.pending_left.contains(user_id)
    }

    /// Everyone who has ever been joined, invited or left.
    pub fn participants(&self) -> HashSet<UserId> {
        self.joined
            .iter()
            .chain(self.invited.iter())
            .chain(self.left.iter())
            .copied()
            .collect()
    }

    pub fn joined_participants(&self) -> &HashSet<UserId> {
        &self.joined
    }

    pub fn joined_or_invited_participants(&self) -> HashSet<UserId> {
        self.joined.union(&self.invited).copied().collect()
    }

    pub fn invited(&self) -> &HashSet<UserId> {
        &self.invited
    }

    pub fn left(&self) -> &HashSet<UserId> {
        &self.left
    }

    pub fn pending_joined(&self) -> &HashSet<UserId> {
        &self.pending_joined
    }

    pub fn pending_invited(&self) -> &HashSet<UserId> {
        &self.pending_invited
    }

    pub fn pending_left(&self) -> &HashSet<UserId> {
        &self.pending_left
    }

    /// Number of pending events waiting for confirmation.
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.len()
    }
}

fn notify(notifier: Option<&dyn StreamListener>, f: impl FnOnce(&dyn StreamListener)) {
    if let Some(listener) = notifier {
        f(listener);
    }
}
