//! Test fixtures and helpers.
//!
//! Deterministic ids, event builders and a persistence double shared by the
//! integration tests and benches.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use streamsync_core::notify::recording::RecordingListener;
use streamsync_core::{
    EncryptedData, EventPayload, MembershipOp, MiniblockHeader, SnapshotMember, StreamEvent,
    StreamId, StreamKind, StreamSnapshot, SyncCookie, UserId,
};
use streamsync_state::StreamStateView;
use streamsync_store::{MemoryStore, Persistence, Result, StoreError};
use streamsync_sync::transport::memory::ScriptedTransport;

static CLOCK: AtomicI64 = AtomicI64::new(1);

/// A distinct `created_at` per call so identical payloads get distinct ids.
fn tick() -> i64 {
    CLOCK.fetch_add(1, Ordering::Relaxed)
}

// ─────────────────────────────────────────────────────────────────────────────
// Ids
// ─────────────────────────────────────────────────────────────────────────────

pub fn user(n: u8) -> UserId {
    UserId::from_bytes([n; 20])
}

/// The user's own profile stream.
pub fn user_stream(user: &UserId) -> StreamId {
    StreamId::for_user(StreamKind::User, user)
}

pub fn space(n: u8) -> StreamId {
    StreamId::space(&[n; 20])
}

pub fn channel(space: &StreamId, name: &str) -> StreamId {
    StreamId::channel(space, name.as_bytes()).expect("space ids always derive channels")
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

pub fn event(creator: UserId, payload: EventPayload) -> StreamEvent {
    StreamEvent::new(creator, tick(), payload).expect("fixture events encode")
}

pub fn membership(user: UserId, op: MembershipOp) -> StreamEvent {
    event(user, EventPayload::Membership { user, op })
}

pub fn join(user: UserId) -> StreamEvent {
    membership(user, MembershipOp::Join)
}

pub fn invite(user: UserId) -> StreamEvent {
    membership(user, MembershipOp::Invite)
}

pub fn leave(user: UserId) -> StreamEvent {
    membership(user, MembershipOp::Leave)
}

/// A display name "encrypted" for the passthrough decryptor.
pub fn display_name(user: UserId, name: &str) -> StreamEvent {
    event(
        user,
        EventPayload::DisplayName(EncryptedData::new("fixture-session", name.as_bytes().to_vec())),
    )
}

pub fn miniblock(miniblock_num: u64, events: Vec<StreamEvent>) -> MiniblockHeader {
    MiniblockHeader {
        miniblock_num,
        events,
    }
}

/// A snapshot at `miniblock_num` with `members` joined.
pub fn snapshot(stream_id: StreamId, miniblock_num: u64, members: &[UserId]) -> StreamSnapshot {
    StreamSnapshot {
        stream_id,
        miniblock_num,
        members: members
            .iter()
            .map(|u| SnapshotMember::new(*u, miniblock_num))
            .collect(),
        minipool: Vec::new(),
        next_cookie: SyncCookie::new(stream_id, miniblock_num),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence double
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    loads: Vec<StreamId>,
    saves: Vec<StreamId>,
    failing_loads: HashSet<StreamId>,
    fail_saves: bool,
}

/// A [`MemoryStore`] that records calls and fails on request.
#[derive(Default)]
pub struct ScriptedPersistence {
    inner: MemoryStore,
    script: Mutex<Script>,
}

impl ScriptedPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a view without recording the call.
    pub async fn seed(&self, view: &StreamStateView) {
        self.inner
            .save_stream(view.stream_id(), view)
            .await
            .expect("memory store saves");
    }

    /// Make every load of `stream_id` fail.
    pub fn fail_loads_for(&self, stream_id: StreamId) {
        self.script().failing_loads.insert(stream_id);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.script().fail_saves = fail;
    }

    /// Ids passed to `load_stream`, in call order.
    pub fn loads(&self) -> Vec<StreamId> {
        self.script().loads.clone()
    }

    /// Ids passed to `save_stream`, in call order.
    pub fn saves(&self) -> Vec<StreamId> {
        self.script().saves.clone()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl Persistence for ScriptedPersistence {
    async fn load_stream(&self, stream_id: &StreamId) -> Result<Option<StreamStateView>> {
        let failing = {
            let mut script = self.script();
            script.loads.push(*stream_id);
            script.failing_loads.contains(stream_id)
        };
        if failing {
            return Err(StoreError::Unavailable(format!("load of {}", stream_id)));
        }
        self.inner.load_stream(stream_id).await
    }

    async fn save_stream(&self, stream_id: &StreamId, view: &StreamStateView) -> Result<()> {
        let failing = {
            let mut script = self.script();
            script.saves.push(*stream_id);
            script.fail_saves
        };
        if failing {
            return Err(StoreError::Unavailable(format!("save of {}", stream_id)));
        }
        self.inner.save_stream(stream_id, view).await
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> Result<()> {
        self.inner.delete_stream(stream_id).await
    }

    async fn stream_ids(&self) -> Result<Vec<StreamId>> {
        self.inner.stream_ids().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fixture
// ─────────────────────────────────────────────────────────────────────────────

/// Collaborators for one engine under test.
pub struct TestFixture {
    pub transport: Arc<ScriptedTransport>,
    pub listener: Arc<RecordingListener>,
    pub store: Arc<ScriptedPersistence>,
}

impl TestFixture {
    pub fn new() -> Self {
        Self {
            transport: Arc::new(ScriptedTransport::new()),
            listener: Arc::new(RecordingListener::new()),
            store: Arc::new(ScriptedPersistence::new()),
        }
    }

    /// Persist a view built from `snapshot`.
    pub async fn seed_stream(&self, snapshot: StreamSnapshot) {
        self.store
            .seed(&StreamStateView::from_snapshot(snapshot))
            .await;
    }

    /// Make `snapshot` available over the network.
    pub fn serve_stream(&self, snapshot: StreamSnapshot) {
        self.transport.set_snapshot(snapshot);
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_events_have_distinct_ids() {
        let a = join(user(1));
        let b = join(user(1));
        assert_ne!(a.event_id, b.event_id);
        assert!(a.verify_id().is_ok());
    }

    #[test]
    fn test_ids_have_expected_kinds() {
        let s = space(3);
        assert_eq!(s.kind(), StreamKind::Space);
        assert_eq!(channel(&s, "general").kind(), StreamKind::Channel);
        assert!(user_stream(&user(1)).kind().is_user_scoped());
    }

    #[tokio::test]
    async fn test_scripted_persistence_records_and_fails() {
        let fixture = TestFixture::new();
        let id = space(1);
        fixture.seed_stream(snapshot(id, 2, &[user(1)])).await;

        let view = fixture.store.load_stream(&id).await.unwrap().unwrap();
        assert_eq!(view.miniblock_num(), 2);

        fixture.store.fail_loads_for(id);
        assert!(matches!(
            fixture.store.load_stream(&id).await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(fixture.store.loads(), vec![id, id]);
        assert!(fixture.store.saves().is_empty());

        fixture.store.fail_saves(true);
        assert!(fixture.store.save_stream(&id, &view).await.is_err());
        assert_eq!(fixture.store.saves(), vec![id]);
    }
}
