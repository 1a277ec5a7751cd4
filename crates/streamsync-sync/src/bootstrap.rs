//! Bulk stream loading at startup.
//!
//! The loader drains three tasks in order, one per scheduler tick:
//!
//! 1. high priority: persistence-first loads of the flagged streams
//! 2. persistence: local loads of everything still outstanding
//! 3. network: fetches of whatever persistence could not supply
//!
//! Within a task, streams are submitted to the shared [`ConcurrencyLimiter`]
//! sorted by [`priority`]. Per-stream failures are counted and never leave
//! the loader. Once the queue drains the loader starts sync if asked to.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use streamsync_core::{InitStatus, StreamId, StreamKind};
use streamsync_state::StreamStateView;
use streamsync_store::Persistence;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::error::{Result, SyncError};
use crate::limiter::ConcurrencyLimiter;
use crate::registry::SyncRegistry;
use crate::transport::SyncTransport;

/// Load order key, lower loads first.
///
/// The user's own streams come first, then streams flagged high priority,
/// then spaces, then channels, then everything else.
pub fn priority(stream_id: &StreamId, high_priority: &HashSet<StreamId>) -> u8 {
    let kind = stream_id.kind();
    if kind.is_user_scoped() {
        0
    } else if high_priority.contains(stream_id) {
        1
    } else {
        match kind {
            StreamKind::Space => 2,
            StreamKind::Channel => 3,
            _ => 4,
        }
    }
}

/// What the loader has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounters {
    pub loaded_from_cache: usize,
    pub loaded_from_network: usize,
    pub failed: usize,
    /// Streams persistence could not supply.
    pub requires_network: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    HighPriority,
    Persistence,
    Network,
}

#[derive(Default)]
struct LoaderState {
    stream_ids: Option<Vec<StreamId>>,
    high_priority: Option<HashSet<StreamId>>,
    start_sync_requested: bool,
    started: bool,
    drained: bool,
    queue: VecDeque<Task>,
    working_set: BTreeSet<StreamId>,
    network_pending: HashSet<StreamId>,
    total: usize,
    high_priority_done: bool,
    persistence_done: bool,
    progress: f64,
    counters: LoadCounters,
    started_at: Option<Instant>,
    handle: Option<JoinHandle<()>>,
}

/// Startup loader feeding a [`SyncRegistry`].
pub struct BootstrapLoader<T: SyncTransport> {
    registry: Arc<SyncRegistry<T>>,
    persistence: Arc<dyn Persistence>,
    limiter: ConcurrencyLimiter,
    state: Mutex<LoaderState>,
    status: watch::Sender<InitStatus>,
    /// Held while a status is computed and delivered, so statuses reach
    /// the watch and the listener in the order they were computed.
    emitting: Mutex<()>,
    stop: CancellationToken,
    span: Span,
}

impl<T: SyncTransport> BootstrapLoader<T> {
    pub fn new(
        registry: Arc<SyncRegistry<T>>,
        persistence: Arc<dyn Persistence>,
        limiter: ConcurrencyLimiter,
    ) -> Self {
        let (status, _) = watch::channel(InitStatus::default());
        Self {
            registry,
            persistence,
            limiter,
            state: Mutex::new(LoaderState::default()),
            status,
            emitting: Mutex::new(()),
            stop: CancellationToken::new(),
            span: tracing::info_span!("bootstrap_loader"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // One-time setup
    // ─────────────────────────────────────────────────────────────────────────

    /// Streams to load. May be called once, before [`Self::start`].
    pub fn set_stream_ids(&self, ids: Vec<StreamId>) -> Result<()> {
        let mut state = self.lock();
        if state.started {
            error!(parent: &self.span, "stream ids set after bootstrap started");
            return Err(SyncError::AlreadyInitialized("bootstrap"));
        }
        if state.stream_ids.is_some() {
            error!(parent: &self.span, "stream ids set twice");
            return Err(SyncError::AlreadyInitialized("stream ids"));
        }
        state.stream_ids = Some(ids);
        Ok(())
    }

    /// Streams to load ahead of the rest. May be called once, before
    /// [`Self::start`].
    pub fn set_high_priority(&self, ids: Vec<StreamId>) -> Result<()> {
        let mut state = self.lock();
        if state.started {
            error!(parent: &self.span, "high priority ids set after bootstrap started");
            return Err(SyncError::AlreadyInitialized("bootstrap"));
        }
        if state.high_priority.is_some() {
            error!(parent: &self.span, "high priority ids set twice");
            return Err(SyncError::AlreadyInitialized("high priority ids"));
        }
        state.high_priority = Some(ids.into_iter().collect());
        Ok(())
    }

    /// Whether to start sync once loading drains. Setting it after the
    /// loader drained starts sync right away.
    pub fn set_start_sync_requested(self: &Arc<Self>, requested: bool) {
        let start_now = {
            let mut state = self.lock();
            let newly = requested && !state.start_sync_requested;
            state.start_sync_requested = requested;
            newly && state.drained
        };
        if start_now && !self.stop.is_cancelled() {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.start_sync().await }.instrument(self.span.clone()));
        }
    }

    /// Queue the three load tasks and begin draining them. May be called once.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.lock();
        if state.started {
            error!(parent: &self.span, "bootstrap started twice");
            return Err(SyncError::AlreadyInitialized("bootstrap"));
        }
        state.started = true;
        state.started_at = Some(Instant::now());

        let mut working_set: BTreeSet<StreamId> =
            state.stream_ids.iter().flatten().copied().collect();
        working_set.extend(state.high_priority.iter().flatten().copied());
        state.total = working_set.len();
        state.working_set = working_set;
        state.queue.extend([Task::HighPriority, Task::Persistence, Task::Network]);

        info!(parent: &self.span, streams = state.total, "bootstrap starting");
        let this = Arc::clone(self);
        state.handle = Some(tokio::spawn(this.run().instrument(self.span.clone())));
        Ok(())
    }

    /// Schedule no further task and wait for the one in flight.
    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self.lock().handle.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(parent: &self.span, error = %err, "bootstrap task failed");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    pub fn status(&self) -> InitStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<InitStatus> {
        self.status.subscribe()
    }

    pub fn counters(&self) -> LoadCounters {
        self.lock().counters
    }

    pub fn is_drained(&self) -> bool {
        self.lock().drained
    }

    /// Streams not yet loaded from anywhere, sorted.
    pub fn outstanding(&self) -> Vec<StreamId> {
        self.lock().working_set.iter().copied().collect()
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Wait until every task has run, or the loader is stopped.
    pub async fn wait_drained(&self) {
        let mut rx = self.status.subscribe();
        while !self.is_drained() {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.stop.cancelled() => return,
            }
        }
    }

    /// Recompute status and tell the listener.
    fn emit_status(&self) {
        let _emitting = self.emitting.lock().unwrap_or_else(PoisonError::into_inner);
        let status = {
            let mut state = self.lock();
            let resolved = state.total - state.working_set.len();
            let progress = if state.total == 0 {
                1.0
            } else {
                resolved as f64 / state.total as f64
            };
            // Never report going backwards.
            state.progress = state.progress.max(progress);
            InitStatus {
                is_high_priority_data_loaded: state.high_priority_done,
                is_local_data_loaded: state.persistence_done,
                is_remote_data_loaded: state.persistence_done && state.network_pending.is_empty(),
                progress: state.progress,
            }
        };
        self.status.send_replace(status);
        self.registry.listener().on_init_status(&status);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduler
    // ─────────────────────────────────────────────────────────────────────────

    async fn run(self: Arc<Self>) {
        loop {
            if self.stop.is_cancelled() {
                debug!("bootstrap stopped");
                return;
            }
            let task = self.lock().queue.pop_front();
            let Some(task) = task else { break };
            debug!(?task, "bootstrap task");
            match task {
                Task::HighPriority => self.load_high_priority().await,
                Task::Persistence => self.load_from_persistence().await,
                Task::Network => self.load_from_network().await,
            }
            tokio::task::yield_now().await;
        }
        self.on_drained().await;
    }

    async fn on_drained(&self) {
        let (counters, elapsed, requested) = {
            let mut state = self.lock();
            state.drained = true;
            (
                state.counters,
                state.started_at.map(|at| at.elapsed()).unwrap_or_default(),
                state.start_sync_requested,
            )
        };
        self.emit_status();
        info!(
            duration_ms = elapsed.as_millis() as u64,
            loaded_from_cache = counters.loaded_from_cache,
            loaded_from_network = counters.loaded_from_network,
            failed = counters.failed,
            requires_network = counters.requires_network,
            "bootstrap finished"
        );
        if requested && !self.stop.is_cancelled() {
            self.start_sync().await;
        }
    }

    async fn start_sync(&self) {
        if let Err(err) = self.registry.start_sync_streams().await {
            error!(error = %err, "failed to start sync after bootstrap");
        }
    }

    /// Outstanding ids in load order, optionally only the flagged ones.
    fn ordered(&self, only_high_priority: bool) -> Vec<StreamId> {
        let state = self.lock();
        let empty = HashSet::new();
        let high_priority = state.high_priority.as_ref().unwrap_or(&empty);
        let mut ids: Vec<StreamId> = state
            .working_set
            .iter()
            .filter(|id| !only_high_priority || high_priority.contains(*id))
            .copied()
            .collect();
        ids.sort_by_key(|id| (priority(id, high_priority), *id));
        ids
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tasks
    // ─────────────────────────────────────────────────────────────────────────

    async fn load_high_priority(self: &Arc<Self>) {
        let ids = self.ordered(true);
        let mut handles = Vec::with_capacity(ids.len());
        for stream_id in ids {
            let this = Arc::clone(self);
            let load = async move {
                if this.load_local(stream_id).await {
                    this.resolve_from_cache(stream_id);
                }
            };
            match self.limiter.spawn(load.instrument(self.span.clone())).await {
                Ok(handle) => handles.push(handle),
                Err(err) => warn!(%stream_id, error = %err, "high priority load not scheduled"),
            }
        }
        join_all(handles).await;
        self.lock().high_priority_done = true;
        self.emit_status();
    }

    async fn load_from_persistence(&self) {
        for stream_id in self.ordered(false) {
            let loaded = self
                .limiter
                .run(self.load_local(stream_id))
                .await
                .unwrap_or(false);
            if loaded {
                self.resolve_from_cache(stream_id);
            } else {
                {
                    let mut state = self.lock();
                    state.counters.requires_network += 1;
                    state.network_pending.insert(stream_id);
                }
                self.emit_status();
            }
        }
        self.lock().persistence_done = true;
        self.emit_status();
    }

    async fn load_from_network(self: &Arc<Self>) {
        let ids = self.ordered(false);
        let mut handles = Vec::with_capacity(ids.len());
        for stream_id in ids {
            let this = Arc::clone(self);
            let fetch = async move {
                let ok = this.load_remote(stream_id).await;
                this.resolve_from_network(stream_id, ok);
            };
            match self.limiter.spawn(fetch.instrument(self.span.clone())).await {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    warn!(%stream_id, error = %err, "network load not scheduled");
                    self.resolve_from_network(stream_id, false);
                }
            }
        }
        join_all(handles).await;
        self.emit_status();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Per-stream work
    // ─────────────────────────────────────────────────────────────────────────

    async fn load_local(&self, stream_id: StreamId) -> bool {
        match self.persistence.load_stream(&stream_id).await {
            Ok(Some(view)) => {
                self.register(stream_id, view).await;
                true
            }
            Ok(None) => {
                debug!(%stream_id, "stream not in persistence");
                false
            }
            Err(err) => {
                warn!(%stream_id, error = %err, "persistence load failed");
                false
            }
        }
    }

    async fn load_remote(&self, stream_id: StreamId) -> bool {
        match self.registry.transport().get_stream(&stream_id).await {
            Ok(snapshot) => {
                let view = StreamStateView::from_snapshot(snapshot);
                if let Err(err) = self.persistence.save_stream(&stream_id, &view).await {
                    warn!(%stream_id, error = %err, "failed to persist fetched stream");
                }
                self.register(stream_id, view).await;
                true
            }
            Err(err) => {
                error!(%stream_id, error = %err, "network load failed");
                false
            }
        }
    }

    /// Hand a loaded view to the registry, joining a live sync if there is one.
    async fn register(&self, stream_id: StreamId, view: StreamStateView) {
        if self.registry.has(&stream_id).await {
            debug!(%stream_id, "stream already registered");
            return;
        }
        let cookie = view.sync_cookie().clone();
        self.registry.set(stream_id, view).await;
        if self.registry.state() == streamsync_core::SyncState::Syncing {
            if let Err(err) = self.registry.add_stream_to_sync(cookie).await {
                warn!(%stream_id, error = %err, "failed to add loaded stream to sync");
            }
        }
    }

    fn resolve_from_cache(&self, stream_id: StreamId) {
        {
            let mut state = self.lock();
            if state.working_set.remove(&stream_id) {
                state.counters.loaded_from_cache += 1;
            }
        }
        self.emit_status();
    }

    fn resolve_from_network(&self, stream_id: StreamId, ok: bool) {
        {
            let mut state = self.lock();
            state.network_pending.remove(&stream_id);
            if state.working_set.remove(&stream_id) {
                if ok {
                    state.counters.loaded_from_network += 1;
                } else {
                    state.counters.failed += 1;
                }
            }
        }
        self.emit_status();
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            error!(error = %err, "bootstrap load panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::transport::memory::{ScriptedTransport, TransportCall};
    use async_trait::async_trait;
    use streamsync_core::notify::recording::RecordingListener;
    use streamsync_core::{StreamListener, StreamSnapshot, SyncState, UserId};
    use streamsync_store::MemoryStore;

    /// Memory store that records the order of `load_stream` calls.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        loads: std::sync::Mutex<Vec<StreamId>>,
    }

    impl RecordingStore {
        fn loads(&self) -> Vec<StreamId> {
            self.loads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Persistence for RecordingStore {
        async fn load_stream(
            &self,
            stream_id: &StreamId,
        ) -> streamsync_store::Result<Option<StreamStateView>> {
            self.loads.lock().unwrap().push(*stream_id);
            self.inner.load_stream(stream_id).await
        }

        async fn save_stream(
            &self,
            stream_id: &StreamId,
            view: &StreamStateView,
        ) -> streamsync_store::Result<()> {
            self.inner.save_stream(stream_id, view).await
        }

        async fn delete_stream(&self, stream_id: &StreamId) -> streamsync_store::Result<()> {
            self.inner.delete_stream(stream_id).await
        }

        async fn stream_ids(&self) -> streamsync_store::Result<Vec<StreamId>> {
            self.inner.stream_ids().await
        }
    }

    struct Harness {
        transport: Arc<ScriptedTransport>,
        listener: Arc<RecordingListener>,
        store: Arc<RecordingStore>,
        registry: Arc<SyncRegistry<ScriptedTransport>>,
        loader: Arc<BootstrapLoader<ScriptedTransport>>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(ScriptedTransport::new());
        let listener = Arc::new(RecordingListener::new());
        let store = Arc::new(RecordingStore::default());
        let registry = Arc::new(
            SyncRegistry::new(Arc::clone(&transport), SyncConfig::default())
                .with_listener(Arc::clone(&listener) as Arc<dyn StreamListener>),
        );
        let loader = Arc::new(BootstrapLoader::new(
            Arc::clone(&registry),
            Arc::clone(&store) as Arc<dyn Persistence>,
            ConcurrencyLimiter::new(50),
        ));
        Harness {
            transport,
            listener,
            store,
            registry,
            loader,
        }
    }

    fn self_stream() -> StreamId {
        StreamId::for_user(StreamKind::User, &UserId::from_bytes([1; 20]))
    }

    fn space() -> StreamId {
        StreamId::space(&[2; 20])
    }

    fn channel() -> StreamId {
        StreamId::channel(&space(), b"general").unwrap()
    }

    async fn persist(store: &RecordingStore, stream_id: StreamId) {
        store
            .inner
            .save_stream(&stream_id, &StreamStateView::empty(stream_id))
            .await
            .unwrap();
    }

    #[test]
    fn test_priority_order() {
        let flagged: HashSet<StreamId> = [channel()].into_iter().collect();
        assert_eq!(priority(&self_stream(), &flagged), 0);
        assert_eq!(priority(&channel(), &flagged), 1);
        assert_eq!(priority(&space(), &flagged), 2);
        assert_eq!(priority(&channel(), &HashSet::new()), 3);
        let dm = StreamId::for_user(StreamKind::Dm, &UserId::from_bytes([3; 20]));
        assert_eq!(priority(&dm, &flagged), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_order_follows_priority() {
        let h = harness();
        persist(&h.store, self_stream()).await;
        persist(&h.store, channel()).await;

        h.loader
            .set_stream_ids(vec![space(), channel(), self_stream()])
            .unwrap();
        h.loader.set_high_priority(vec![channel()]).unwrap();
        h.loader.start().unwrap();
        h.loader.wait_drained().await;

        assert_eq!(h.store.loads(), vec![channel(), self_stream(), space()]);
        assert_eq!(
            h.transport.calls(),
            vec![TransportCall::GetStream(space())]
        );
        assert_eq!(
            h.loader.counters(),
            LoadCounters {
                loaded_from_cache: 2,
                loaded_from_network: 1,
                failed: 0,
                requires_network: 1,
            }
        );
        assert_eq!(
            h.registry.get_stream_ids().await.len(),
            3
        );
        // Fetched streams are written back.
        assert!(h.store.inner.load_stream(&space()).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_monotone_and_completes() {
        let h = harness();
        let ids: Vec<StreamId> = (0..20u8).map(|n| StreamId::space(&[n; 20])).collect();
        for id in ids.iter().step_by(2) {
            persist(&h.store, *id).await;
        }
        h.transport.set_missing(ids[1]);

        h.loader.set_stream_ids(ids.clone()).unwrap();
        h.loader.start().unwrap();
        h.loader.wait_drained().await;

        let statuses = h.listener.init_statuses();
        assert!(!statuses.is_empty());
        for pair in statuses.windows(2) {
            assert!(pair[0].progress <= pair[1].progress);
        }
        assert!(h.loader.outstanding().is_empty());
        let last = statuses.last().unwrap();
        assert_eq!(last.progress, 1.0);
        assert!(last.is_high_priority_data_loaded);
        assert!(last.is_local_data_loaded);
        assert!(last.is_remote_data_loaded);
        assert_eq!(h.loader.counters().failed, 1);
        assert!(!h.registry.has(&ids[1]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_stays_below_one_until_empty() {
        let h = harness();
        h.loader
            .set_stream_ids(vec![space(), channel()])
            .unwrap();
        h.loader.start().unwrap();
        h.loader.wait_drained().await;

        let statuses = h.listener.init_statuses();
        let first_complete = statuses
            .iter()
            .position(|s| s.progress >= 1.0)
            .unwrap();
        // Nothing was cached, so only the network task can finish the set.
        assert!(statuses[first_complete].is_local_data_loaded);
        assert!(statuses[..first_complete].iter().all(|s| s.progress < 1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_working_set_reports_complete() {
        let h = harness();
        h.loader.start().unwrap();
        h.loader.wait_drained().await;
        assert_eq!(h.loader.status().progress, 1.0);
        assert!(h.loader.status().is_remote_data_loaded);
    }

    #[tokio::test]
    async fn test_one_time_initializers() {
        let h = harness();
        h.loader.set_stream_ids(vec![space()]).unwrap();
        assert!(matches!(
            h.loader.set_stream_ids(vec![space()]),
            Err(SyncError::AlreadyInitialized(_))
        ));
        h.loader.set_high_priority(vec![]).unwrap();
        assert!(matches!(
            h.loader.set_high_priority(vec![]),
            Err(SyncError::AlreadyInitialized(_))
        ));
        h.loader.start().unwrap();
        assert!(matches!(
            h.loader.start(),
            Err(SyncError::AlreadyInitialized(_))
        ));
        h.loader.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_sync_starts_after_drain() {
        let h = harness();
        persist(&h.store, space()).await;
        h.loader.set_stream_ids(vec![space()]).unwrap();
        h.loader.set_start_sync_requested(true);
        h.loader.start().unwrap();
        h.loader.wait_drained().await;

        let mut rx = h.registry.subscribe_state();
        rx.wait_for(|s| *s == SyncState::Syncing).await.unwrap();
        assert_eq!(
            h.transport.start_calls(),
            vec![vec![StreamStateView::empty(space()).sync_cookie().clone()]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_requested_after_drain_starts_immediately() {
        let h = harness();
        h.loader.start().unwrap();
        h.loader.wait_drained().await;
        assert_eq!(h.registry.state(), SyncState::NotSyncing);

        h.loader.set_start_sync_requested(true);
        let mut rx = h.registry.subscribe_state();
        rx.wait_for(|s| *s == SyncState::Syncing).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_tick_schedules_nothing() {
        let h = harness();
        persist(&h.store, space()).await;
        h.loader.set_stream_ids(vec![space()]).unwrap();
        h.loader.set_start_sync_requested(true);
        h.loader.start().unwrap();
        h.loader.stop().await;

        assert!(h.store.loads().is_empty());
        assert!(!h.loader.is_drained());
        assert_eq!(h.registry.state(), SyncState::NotSyncing);
    }

    #[tokio::test]
    async fn test_ids_cannot_change_after_start() {
        let h = harness();
        h.loader.start().unwrap();
        assert!(matches!(
            h.loader.set_stream_ids(vec![space()]),
            Err(SyncError::AlreadyInitialized(_))
        ));
        assert!(matches!(
            h.loader.set_high_priority(vec![space()]),
            Err(SyncError::AlreadyInitialized(_))
        ));
        h.loader.wait_drained().await;
        assert!(h.registry.get_stream_ids().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_progress_is_monotone_across_workers() {
        let h = harness();
        let ids: Vec<StreamId> = (0..1000u16)
            .map(|n| {
                let mut address = [0u8; 20];
                address[..2].copy_from_slice(&n.to_be_bytes());
                StreamId::space(&address)
            })
            .collect();
        for id in &ids {
            h.transport.set_snapshot(StreamSnapshot::empty(*id));
        }

        h.loader.set_stream_ids(ids.clone()).unwrap();
        h.loader.start().unwrap();
        h.loader.wait_drained().await;

        let statuses = h.listener.init_statuses();
        for pair in statuses.windows(2) {
            assert!(
                pair[0].progress <= pair[1].progress,
                "progress went from {} to {}",
                pair[0].progress,
                pair[1].progress
            );
        }
        assert_eq!(statuses.last().map(|s| s.progress), Some(1.0));
        assert_eq!(h.loader.status().progress, 1.0);
        assert_eq!(h.loader.counters().loaded_from_network, ids.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_loaded_while_starting_joins_subscription() {
        let h = harness();
        h.transport.hold_start(true);
        let registry = Arc::clone(&h.registry);
        let start = tokio::spawn(async move { registry.start_sync_streams().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(h.registry.state(), SyncState::Starting);

        persist(&h.store, space()).await;
        h.loader.set_stream_ids(vec![space()]).unwrap();
        h.loader.start().unwrap();
        h.loader.wait_drained().await;
        assert!(h.registry.has(&space()).await);
        assert_eq!(h.transport.start_calls(), vec![Vec::new()]);

        assert!(h.transport.confirm_subscription().await);
        start.await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let sync_id = h.registry.sync_id().unwrap();
        assert!(h.transport.calls().contains(&TransportCall::AddToSubscription(
            sync_id,
            StreamStateView::empty(space()).sync_cookie().clone()
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_loaded_while_syncing_joins_subscription() {
        let h = harness();
        h.registry.start_sync_streams().await.unwrap();
        let sync_id = h.registry.sync_id().unwrap();

        let mut snapshot = StreamSnapshot::empty(space());
        snapshot.miniblock_num = 4;
        snapshot.next_cookie = streamsync_core::SyncCookie::new(space(), 4);
        h.transport.set_snapshot(snapshot);

        h.loader.set_stream_ids(vec![space()]).unwrap();
        h.loader.start().unwrap();
        h.loader.wait_drained().await;

        assert!(h.transport.calls().contains(&TransportCall::AddToSubscription(
            sync_id,
            streamsync_core::SyncCookie::new(space(), 4)
        )));
    }
}
