//! Reconciled local state of one stream.
//!
//! A view starts from a snapshot, then absorbs pending events (minipool)
//! and confirmed miniblocks in order. Miniblock numbers must advance by
//! exactly one; anything older is a duplicate and anything further ahead
//! is a gap the owner resolves by re-fetching the stream.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use streamsync_core::{
    AttributeKind, Confirmation, EncryptedData, EventId, EventPayload, MembershipOp,
    MiniblockHeader, NftBadge, StreamEvent, StreamId, StreamListener, StreamSnapshot, SyncCookie,
    UserId,
};
use tracing::{debug, warn};

use crate::attributes::{DisplayName, UserAttributeReconciler};
use crate::error::{Result, StateError};
use crate::membership::MembershipReconciler;

/// Result of applying a miniblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The update advanced the view.
    Applied,
    /// The miniblock was already applied; nothing changed.
    Duplicate,
    /// The miniblock skips ahead; the view needs a fresh snapshot.
    Gap { expected: u64, got: u64 },
}

/// Ciphertext waiting for the decryption service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionRequest {
    pub event_id: EventId,
    pub user_id: UserId,
    pub encrypted: EncryptedData,
}

/// Merged per-member view.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMember {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub linked_address: Option<[u8; 20]>,
    pub nft: Option<NftBadge>,
}

/// What persistence stores for a view. Loading replays it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedStream {
    pub snapshot: StreamSnapshot,
    pub miniblock_num: u64,
    pub confirmed: Vec<(u64, StreamEvent)>,
    pub pending: Vec<StreamEvent>,
    pub cookie: SyncCookie,
}

/// Local state of one stream.
#[derive(Debug, Clone)]
pub struct StreamStateView {
    stream_id: StreamId,
    snapshot: StreamSnapshot,
    miniblock_num: u64,
    cookie: SyncCookie,

    confirmed: Vec<(u64, StreamEvent)>,
    confirmed_ids: HashSet<EventId>,
    pending: Vec<StreamEvent>,
    pending_ids: HashSet<EventId>,

    membership: MembershipReconciler,
    display_names: UserAttributeReconciler<DisplayName>,
    linked_addresses: UserAttributeReconciler<[u8; 20]>,
    nfts: UserAttributeReconciler<NftBadge>,

    decryption_queue: Vec<DecryptionRequest>,
}

impl StreamStateView {
    /// Build a view from a snapshot. Snapshot members are applied as
    /// confirmed joins without notifications; the minipool becomes the
    /// pending log.
    pub fn from_snapshot(snapshot: StreamSnapshot) -> Self {
        let stream_id = snapshot.stream_id;
        let members = snapshot.members.clone();
        let minipool = snapshot.minipool.clone();

        let mut view = Self {
            stream_id,
            miniblock_num: snapshot.miniblock_num,
            cookie: snapshot.next_cookie.clone(),
            snapshot,
            confirmed: Vec::new(),
            confirmed_ids: HashSet::new(),
            pending: Vec::new(),
            pending_ids: HashSet::new(),
            membership: MembershipReconciler::new(stream_id),
            display_names: UserAttributeReconciler::new(stream_id, AttributeKind::DisplayName),
            linked_addresses: UserAttributeReconciler::new(stream_id, AttributeKind::LinkedAddress),
            nfts: UserAttributeReconciler::new(stream_id, AttributeKind::Nft),
            decryption_queue: Vec::new(),
        };

        for member in members {
            let user_id = member.user_id;
            view.membership.apply_membership_event(
                user_id,
                MembershipOp::Join,
                Confirmation::Confirmed,
                None,
            );
            if let Some(encrypted) = member.display_name {
                let event_id = snapshot_event_id(&stream_id, &user_id, AttributeKind::DisplayName);
                view.queue_decryption(event_id, user_id, &encrypted);
                view.display_names.add_event(
                    event_id,
                    user_id,
                    DisplayName::new(encrypted),
                    Confirmation::Confirmed,
                    None,
                );
            }
            if let Some(address) = member.linked_address {
                let event_id =
                    snapshot_event_id(&stream_id, &user_id, AttributeKind::LinkedAddress);
                view.linked_addresses
                    .add_event(event_id, user_id, address, Confirmation::Confirmed, None);
            }
            if let Some(nft) = member.nft {
                let event_id = snapshot_event_id(&stream_id, &user_id, AttributeKind::Nft);
                view.nfts
                    .add_event(event_id, user_id, nft, Confirmation::Confirmed, None);
            }
        }

        for event in minipool {
            if let Err(e) = view.append_event(event, None) {
                warn!(stream_id = %stream_id, error = %e, "dropping minipool event from snapshot");
            }
        }

        view
    }

    /// An empty view at miniblock 0.
    pub fn empty(stream_id: StreamId) -> Self {
        Self::from_snapshot(StreamSnapshot::empty(stream_id))
    }

    /// Replace all state with a fresh snapshot (sync reset or gap recovery).
    pub fn reinitialize(&mut self, snapshot: StreamSnapshot) {
        debug!(
            stream_id = %self.stream_id,
            from = self.miniblock_num,
            to = snapshot.miniblock_num,
            "reinitializing stream view"
        );
        *self = Self::from_snapshot(snapshot);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Applying events
    // ─────────────────────────────────────────────────────────────────────────

    /// Append one pending event. Returns false when the event is already
    /// known, pending or confirmed.
    pub fn append_event(
        &mut self,
        event: StreamEvent,
        listener: Option<&dyn StreamListener>,
    ) -> Result<bool> {
        let event_id = event.event_id;
        if self.pending_ids.contains(&event_id) || self.confirmed_ids.contains(&event_id) {
            return Ok(false);
        }
        self.apply_effects(&event, Confirmation::Pending, listener)?;
        self.pending_ids.insert(event_id);
        self.pending.push(event);
        Ok(true)
    }

    /// Append a batch of pending events, logging and skipping rejects.
    /// Returns how many were new.
    pub fn append_events(
        &mut self,
        events: impl IntoIterator<Item = StreamEvent>,
        listener: Option<&dyn StreamListener>,
    ) -> usize {
        let mut added = 0;
        for event in events {
            let event_id = event.event_id;
            match self.append_event(event, listener) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(stream_id = %self.stream_id, event_id = %event_id, error = %e, "rejected pending event")
                }
            }
        }
        added
    }

    /// Apply a committed miniblock.
    pub fn confirm_miniblock(
        &mut self,
        header: MiniblockHeader,
        listener: Option<&dyn StreamListener>,
    ) -> ApplyOutcome {
        if header.miniblock_num <= self.miniblock_num {
            return ApplyOutcome::Duplicate;
        }
        let expected = self.miniblock_num + 1;
        if header.miniblock_num > expected {
            return ApplyOutcome::Gap {
                expected,
                got: header.miniblock_num,
            };
        }
        self.commit_miniblock(header, listener);
        ApplyOutcome::Applied
    }

    /// Apply one pushed update: the optional miniblock first, then new
    /// pending events, then the cookie. A gap leaves the view untouched.
    pub fn apply_update(
        &mut self,
        next_cookie: SyncCookie,
        events: Vec<StreamEvent>,
        miniblock: Option<MiniblockHeader>,
        listener: Option<&dyn StreamListener>,
    ) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::Applied;
        if let Some(header) = miniblock {
            outcome = self.confirm_miniblock(header, listener);
            if matches!(outcome, ApplyOutcome::Gap { .. }) {
                return outcome;
            }
        }
        self.append_events(events, listener);
        self.cookie = next_cookie;
        outcome
    }

    fn commit_miniblock(&mut self, header: MiniblockHeader, listener: Option<&dyn StreamListener>) {
        let num = header.miniblock_num;
        for event in header.events {
            let event_id = event.event_id;
            if !self.confirmed_ids.insert(event_id) {
                continue;
            }
            if self.pending_ids.remove(&event_id) {
                self.pending.retain(|e| e.event_id != event_id);
            }
            if let Err(e) = self.apply_effects(&event, Confirmation::Confirmed, listener) {
                warn!(stream_id = %self.stream_id, event_id = %event_id, error = %e, "rejected confirmed event");
            }
            self.confirmed.push((num, event));
        }
        self.miniblock_num = self.miniblock_num.max(num);
    }

    fn apply_effects(
        &mut self,
        event: &StreamEvent,
        confirmation: Confirmation,
        listener: Option<&dyn StreamListener>,
    ) -> Result<()> {
        let event_id = event.event_id;
        let creator = event.creator;
        match &event.payload {
            EventPayload::Membership { user, op } => match confirmation {
                Confirmation::Pending => {
                    self.membership.append_pending(event_id, *user, *op, listener)
                }
                Confirmation::Confirmed => {
                    if !self.membership.confirm(&event_id, listener) {
                        self.membership.apply_membership_event(*user, *op, confirmation, listener);
                    }
                }
            },
            EventPayload::DisplayName(encrypted) => {
                self.require_member(&creator)?;
                if self.display_names.event_for(&creator) != Some(&event_id) {
                    self.queue_decryption(event_id, creator, encrypted);
                }
                self.display_names.apply(
                    event_id,
                    creator,
                    DisplayName::new(encrypted.clone()),
                    confirmation,
                    listener,
                );
            }
            EventPayload::LinkedAddress(address) => {
                self.require_member(&creator)?;
                self.linked_addresses
                    .apply(event_id, creator, *address, confirmation, listener);
            }
            EventPayload::Nft(nft) => {
                self.require_member(&creator)?;
                self.nfts
                    .apply(event_id, creator, nft.clone(), confirmation, listener);
            }
            EventPayload::Message(_) | EventPayload::Opaque(_) => {}
        }
        Ok(())
    }

    fn require_member(&self, user_id: &UserId) -> Result<()> {
        if self.membership.is_joined_or_pending(user_id) {
            Ok(())
        } else {
            Err(StateError::NotAMember {
                stream_id: self.stream_id,
                user_id: *user_id,
            })
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Decryption
    // ─────────────────────────────────────────────────────────────────────────

    fn queue_decryption(&mut self, event_id: EventId, user_id: UserId, encrypted: &EncryptedData) {
        if self.decryption_queue.iter().any(|r| r.event_id == event_id) {
            return;
        }
        self.decryption_queue.push(DecryptionRequest {
            event_id,
            user_id,
            encrypted: encrypted.clone(),
        });
    }

    /// Drain the ciphertexts waiting to be decrypted.
    pub fn take_decryption_requests(&mut self) -> Vec<DecryptionRequest> {
        std::mem::take(&mut self.decryption_queue)
    }

    /// Feed back the plaintext of a display name.
    pub fn on_decrypted_content(
        &mut self,
        event_id: EventId,
        plaintext: &[u8],
        listener: Option<&dyn StreamListener>,
    ) -> Result<()> {
        let text = std::str::from_utf8(plaintext)
            .map_err(|_| StateError::InvalidPlaintext { event_id })?
            .to_string();
        if self
            .display_names
            .update_value(&event_id, |v| v.plaintext = Some(text.clone()), listener)
        {
            Ok(())
        } else {
            Err(StateError::UnknownEvent(event_id))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    pub fn to_persisted(&self) -> PersistedStream {
        PersistedStream {
            snapshot: self.snapshot.clone(),
            miniblock_num: self.miniblock_num,
            confirmed: self.confirmed.clone(),
            pending: self.pending.clone(),
            cookie: self.cookie.clone(),
        }
    }

    /// Rebuild a view by replaying what was persisted. Decrypted plaintexts
    /// are not persisted; their ciphertexts are queued again.
    pub fn from_persisted(persisted: PersistedStream) -> Self {
        let mut view = Self::from_snapshot(persisted.snapshot);

        let mut batches: Vec<MiniblockHeader> = Vec::new();
        for (num, event) in persisted.confirmed {
            match batches.last_mut() {
                Some(header) if header.miniblock_num == num => header.events.push(event),
                _ => batches.push(MiniblockHeader {
                    miniblock_num: num,
                    events: vec![event],
                }),
            }
        }
        for header in batches {
            view.commit_miniblock(header, None);
        }

        view.append_events(persisted.pending, None);
        view.miniblock_num = view.miniblock_num.max(persisted.miniblock_num);
        view.cookie = persisted.cookie;
        view
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Latest confirmed miniblock number.
    pub fn miniblock_num(&self) -> u64 {
        self.miniblock_num
    }

    /// Cookie to resume a subscription from.
    pub fn sync_cookie(&self) -> &SyncCookie {
        &self.cookie
    }

    pub fn set_sync_cookie(&mut self, cookie: SyncCookie) {
        self.cookie = cookie;
    }

    pub fn snapshot(&self) -> &StreamSnapshot {
        &self.snapshot
    }

    pub fn confirmed_events(&self) -> &[(u64, StreamEvent)] {
        &self.confirmed
    }

    pub fn pending_events(&self) -> &[StreamEvent] {
        &self.pending
    }

    pub fn membership(&self) -> &MembershipReconciler {
        &self.membership
    }

    pub fn display_names(&self) -> &UserAttributeReconciler<DisplayName> {
        &self.display_names
    }

    pub fn linked_addresses(&self) -> &UserAttributeReconciler<[u8; 20]> {
        &self.linked_addresses
    }

    pub fn nfts(&self) -> &UserAttributeReconciler<NftBadge> {
        &self.nfts
    }

    /// Joined members with their latest attributes, sorted by user id.
    pub fn members(&self) -> Vec<StreamMember> {
        let mut users: Vec<UserId> = self.membership.joined_participants().iter().copied().collect();
        users.sort();
        users
            .into_iter()
            .map(|user_id| StreamMember {
                user_id,
                display_name: self
                    .display_names
                    .get(&user_id)
                    .and_then(|name| name.plaintext.clone()),
                linked_address: self.linked_addresses.get(&user_id).copied(),
                nft: self.nfts.get(&user_id).cloned(),
            })
            .collect()
    }
}

/// Synthetic id for attribute values that arrive inside a snapshot.
fn snapshot_event_id(stream_id: &StreamId, user_id: &UserId, kind: AttributeKind) -> EventId {
    let tag: u8 = match kind {
        AttributeKind::DisplayName => 1,
        AttributeKind::LinkedAddress => 2,
        AttributeKind::Nft => 3,
    };
    let mut buf = Vec::with_capacity(1 + 32 + 20 + 1);
    buf.push(0xff);
    buf.extend_from_slice(stream_id.as_bytes());
    buf.extend_from_slice(user_id.as_bytes());
    buf.push(tag);
    EventId::hash(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamsync_core::notify::recording::{Notification, RecordingListener};
    use streamsync_core::SnapshotMember;

    fn stream() -> StreamId {
        StreamId::space(&[1; 20])
    }

    fn user(n: u8) -> UserId {
        UserId::from_bytes([n; 20])
    }

    fn event(creator: u8, at: i64, payload: EventPayload) -> StreamEvent {
        StreamEvent::new(user(creator), at, payload).unwrap()
    }

    fn join(u: u8, at: i64) -> StreamEvent {
        event(
            u,
            at,
            EventPayload::Membership {
                user: user(u),
                op: MembershipOp::Join,
            },
        )
    }

    fn snapshot_with_member(u: u8) -> StreamSnapshot {
        let mut snapshot = StreamSnapshot::empty(stream());
        snapshot.miniblock_num = 3;
        snapshot.next_cookie = SyncCookie::new(stream(), 3);
        let mut member = SnapshotMember::new(user(u), 1);
        member.display_name = Some(EncryptedData::new("session", b"bob".to_vec()));
        member.linked_address = Some([7; 20]);
        snapshot.members.push(member);
        snapshot
    }

    #[test]
    fn test_from_snapshot_populates_members() {
        let mut view = StreamStateView::from_snapshot(snapshot_with_member(2));
        assert_eq!(view.miniblock_num(), 3);
        assert!(view.membership().is_member(MembershipOp::Join, &user(2)));
        assert_eq!(view.linked_addresses().get(&user(2)), Some(&[7; 20]));

        let requests = view.take_decryption_requests();
        assert_eq!(requests.len(), 1);
        assert!(view.take_decryption_requests().is_empty());

        view.on_decrypted_content(requests[0].event_id, b"bob", None).unwrap();
        assert_eq!(view.members()[0].display_name.as_deref(), Some("bob"));
    }

    #[test]
    fn test_pending_then_confirmed_moves_event() {
        let listener = RecordingListener::new();
        let mut view = StreamStateView::empty(stream());
        let j = join(4, 10);

        assert!(view.append_event(j.clone(), Some(&listener)).unwrap());
        assert!(!view.append_event(j.clone(), Some(&listener)).unwrap());
        assert_eq!(view.pending_events().len(), 1);

        let outcome = view.confirm_miniblock(
            MiniblockHeader {
                miniblock_num: 1,
                events: vec![j],
            },
            Some(&listener),
        );
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert!(view.pending_events().is_empty());
        assert_eq!(view.confirmed_events().len(), 1);
        assert!(view.membership().is_member(MembershipOp::Join, &user(4)));
        assert_eq!(
            listener.count(|n| matches!(n, Notification::NewUserJoined(..))),
            1
        );
    }

    #[test]
    fn test_duplicate_and_gap_detection() {
        let mut view = StreamStateView::empty(stream());
        let first = MiniblockHeader {
            miniblock_num: 1,
            events: vec![join(1, 1)],
        };
        assert_eq!(view.confirm_miniblock(first.clone(), None), ApplyOutcome::Applied);
        assert_eq!(view.confirm_miniblock(first, None), ApplyOutcome::Duplicate);
        assert_eq!(view.confirmed_events().len(), 1);

        let far = MiniblockHeader {
            miniblock_num: 5,
            events: vec![join(2, 2)],
        };
        assert_eq!(
            view.confirm_miniblock(far, None),
            ApplyOutcome::Gap {
                expected: 2,
                got: 5
            }
        );
        assert_eq!(view.miniblock_num(), 1);
        assert!(!view.membership().is_member(MembershipOp::Join, &user(2)));
    }

    #[test]
    fn test_attribute_from_non_member_is_rejected() {
        let mut view = StreamStateView::empty(stream());
        let e = event(9, 1, EventPayload::LinkedAddress([1; 20]));

        assert!(matches!(
            view.append_event(e, None),
            Err(StateError::NotAMember { .. })
        ));
        assert!(view.pending_events().is_empty());
        assert!(view.linked_addresses().users().is_empty());
    }

    #[test]
    fn test_apply_update_refreshes_cookie() {
        let mut view = StreamStateView::empty(stream());
        let cookie = SyncCookie::new(stream(), 1).with_minipool_gen(2);
        let outcome = view.apply_update(
            cookie.clone(),
            vec![join(3, 5)],
            Some(MiniblockHeader {
                miniblock_num: 1,
                events: vec![join(1, 1)],
            }),
            None,
        );
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(view.sync_cookie(), &cookie);
        assert_eq!(view.pending_events().len(), 1);
        assert!(view.membership().pending_joined().contains(&user(3)));
    }

    #[test]
    fn test_gap_update_keeps_old_cookie() {
        let mut view = StreamStateView::empty(stream());
        let before = view.sync_cookie().clone();
        let outcome = view.apply_update(
            SyncCookie::new(stream(), 9),
            vec![join(3, 5)],
            Some(MiniblockHeader {
                miniblock_num: 9,
                events: vec![],
            }),
            None,
        );
        assert!(matches!(outcome, ApplyOutcome::Gap { .. }));
        assert_eq!(view.sync_cookie(), &before);
        assert!(view.pending_events().is_empty());
    }

    #[test]
    fn test_persisted_round_trip_by_replay() {
        let mut view = StreamStateView::from_snapshot(snapshot_with_member(2));
        view.confirm_miniblock(
            MiniblockHeader {
                miniblock_num: 4,
                events: vec![join(5, 1)],
            },
            None,
        );
        view.confirm_miniblock(
            MiniblockHeader {
                miniblock_num: 5,
                events: vec![],
            },
            None,
        );
        view.append_event(event(5, 2, EventPayload::LinkedAddress([8; 20])), None)
            .unwrap();
        view.set_sync_cookie(SyncCookie::new(stream(), 5).with_minipool_gen(1));

        let restored = StreamStateView::from_persisted(view.to_persisted());
        assert_eq!(restored.miniblock_num(), 5);
        assert_eq!(restored.sync_cookie(), view.sync_cookie());
        assert_eq!(restored.confirmed_events(), view.confirmed_events());
        assert_eq!(restored.pending_events(), view.pending_events());
        assert_eq!(restored.linked_addresses().get(&user(5)), Some(&[8; 20]));
        assert_eq!(
            restored.membership().joined_participants(),
            view.membership().joined_participants()
        );
    }

    #[test]
    fn test_reinitialize_discards_local_state() {
        let mut view = StreamStateView::empty(stream());
        view.append_event(join(1, 1), None).unwrap();
        view.reinitialize(snapshot_with_member(2));
        assert!(view.pending_events().is_empty());
        assert_eq!(view.miniblock_num(), 3);
        assert_eq!(view.members().len(), 1);
    }
}
