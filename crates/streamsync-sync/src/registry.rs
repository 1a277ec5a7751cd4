//! The sync registry: owner of the stream map and the live subscription.
//!
//! ```text
//!   start_sync_streams ──► Starting ──New──► Syncing ◄──New── Retrying
//!                              │               │  ▲             ▲  │
//!                              │               │  └─────────────┘  │
//!                              │               └──── error ────────┘
//!                              └──── stop / terminal ──► Canceling ──► NotSyncing
//! ```
//!
//! One background task (the push loop) owns the subscription. It opens it
//! with the cookie of every registered stream, routes each pushed update to
//! that stream's view, and on a transient failure waits out an exponential
//! backoff before resubscribing with the latest cookies. Terminal failures
//! and explicit stops end the loop, which then tears the registry down.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use streamsync_core::{NoopListener, StreamId, StreamListener, SyncCookie, SyncId, SyncState};
use streamsync_state::{ApplyOutcome, Decryptor, StreamStateView};
use streamsync_store::Persistence;
use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::backoff::{backoff_wait, next_retry_count, retry_delay, stream_down_delay};
use crate::config::SyncConfig;
use crate::error::{ErrorClass, Result, SyncError};
use crate::keepalive::{Keepalive, KeepaliveAction};
use crate::messages::{StreamUpdate, SyncOp, SyncResponse};
use crate::transport::SyncTransport;

/// A stream view as shared between the registry and its readers.
pub type SharedView = Arc<tokio::sync::Mutex<StreamStateView>>;

type FirstOutcome = Option<oneshot::Sender<Result<()>>>;

/// Point-in-time summary of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub state: SyncState,
    pub streams: usize,
    pub sync_id: Option<SyncId>,
    pub retry_count: u32,
}

#[derive(Default)]
struct Control {
    sync_id: Option<SyncId>,
    retry_count: u32,
    loop_handle: Option<JoinHandle<()>>,
    loop_token: CancellationToken,
    retry_release: Option<CancellationToken>,
    backgrounded: bool,
    /// Streams whose cookies went into the subscription being opened.
    subscribed: HashSet<StreamId>,
}

/// Owner of the stream map and the sync state machine.
pub struct SyncRegistry<T: SyncTransport> {
    transport: Arc<T>,
    config: SyncConfig,
    streams: RwLock<HashMap<StreamId, SharedView>>,
    state: watch::Sender<SyncState>,
    online: watch::Sender<bool>,
    control: Mutex<Control>,
    /// Serializes state changes with their notifications.
    transitions: Mutex<()>,
    listener: Arc<dyn StreamListener>,
    persistence: Option<Arc<dyn Persistence>>,
    decryptor: Option<Arc<dyn Decryptor>>,
    span: Span,
}

impl<T: SyncTransport> SyncRegistry<T> {
    /// Create an idle registry.
    pub fn new(transport: Arc<T>, config: SyncConfig) -> Self {
        let (state, _) = watch::channel(SyncState::NotSyncing);
        let (online, _) = watch::channel(true);
        Self {
            transport,
            config,
            streams: RwLock::new(HashMap::new()),
            state,
            online,
            control: Mutex::new(Control::default()),
            transitions: Mutex::new(()),
            listener: Arc::new(NoopListener),
            persistence: None,
            decryptor: None,
            span: tracing::info_span!("sync_registry"),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn StreamListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Save every view after it is updated.
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Decrypt queued ciphertexts after every update.
    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// Log records from this registry and its tasks are emitted inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn listener(&self) -> &Arc<dyn StreamListener> {
        &self.listener
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Id of the confirmed subscription, if syncing.
    pub fn sync_id(&self) -> Option<SyncId> {
        self.control().sync_id.clone()
    }

    /// Failures since the last successful subscription, capped at the
    /// configured maximum exponent.
    pub fn retry_count(&self) -> u32 {
        self.control().retry_count
    }

    pub fn is_backgrounded(&self) -> bool {
        self.control().backgrounded
    }

    pub async fn stats(&self) -> SyncStats {
        let streams = self.size().await;
        let control = self.control();
        SyncStats {
            state: self.state(),
            streams,
            sync_id: control.sync_id.clone(),
            retry_count: control.retry_count,
        }
    }

    /// Move to `next` if the transition table allows it.
    ///
    /// Illegal requests are logged and leave the state unchanged.
    fn transition(&self, next: SyncState) -> Result<()> {
        let _serial = self.transitions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(from = %current, to = %next, "sync state");
                *current = next;
                true
            } else {
                error!(from = %current, to = %next, "invalid sync state transition");
                result = Err(SyncError::InvalidTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        if result.is_ok() {
            self.listener.on_sync_state_changed(next);
        }
        result
    }

    /// Wait until the state is Syncing, Canceling or NotSyncing.
    async fn wait_for_settled_state(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|s| !matches!(s, SyncState::Starting | SyncState::Retrying))
            .await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stream map
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn has(&self, stream_id: &StreamId) -> bool {
        self.streams.read().await.contains_key(stream_id)
    }

    pub async fn get(&self, stream_id: &StreamId) -> Option<SharedView> {
        self.streams.read().await.get(stream_id).cloned()
    }

    /// Register a view, replacing any previous one for the same stream.
    pub async fn set(&self, stream_id: StreamId, view: StreamStateView) -> SharedView {
        let shared = Arc::new(tokio::sync::Mutex::new(view));
        self.streams
            .write()
            .await
            .insert(stream_id, Arc::clone(&shared));
        shared
    }

    /// Drop a view without touching the subscription.
    pub async fn delete(&self, stream_id: &StreamId) -> bool {
        self.streams.write().await.remove(stream_id).is_some()
    }

    pub async fn size(&self) -> usize {
        self.streams.read().await.len()
    }

    /// All views, ordered by stream id.
    pub async fn get_streams(&self) -> Vec<SharedView> {
        self.sorted_entries()
            .await
            .into_iter()
            .map(|(_, view)| view)
            .collect()
    }

    /// All registered ids, sorted.
    pub async fn get_stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    async fn sorted_entries(&self) -> Vec<(StreamId, SharedView)> {
        let mut entries: Vec<(StreamId, SharedView)> = self
            .streams
            .read()
            .await
            .iter()
            .map(|(id, view)| (*id, Arc::clone(view)))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Latest cookie of every registered stream.
    async fn current_cookies(&self) -> Vec<SyncCookie> {
        let mut cookies = Vec::new();
        for (_, view) in self.sorted_entries().await {
            cookies.push(view.lock().await.sync_cookie().clone());
        }
        cookies
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the push loop if it is not running.
    ///
    /// Resolves once the first subscription attempt settles: `Ok` when the
    /// server confirmed it or a transient failure put the loop into
    /// retrying, `Err` when the server rejected the client. Calling it
    /// while a loop is alive is a no-op.
    pub async fn start_sync_streams(self: &Arc<Self>) -> Result<()> {
        let state = self.state();
        if state != SyncState::NotSyncing {
            debug!(parent: &self.span, state = %state, "sync already started");
            return Ok(());
        }
        // Only one caller wins NotSyncing -> Starting. The listener hears
        // about it with the control lock free.
        {
            let _serial = self.transitions.lock().unwrap_or_else(PoisonError::into_inner);
            let won = self.state.send_if_modified(|current| {
                let won = *current == SyncState::NotSyncing;
                if won {
                    *current = SyncState::Starting;
                }
                won
            });
            if !won {
                debug!(parent: &self.span, "sync already started");
                return Ok(());
            }
            debug!(parent: &self.span, from = %SyncState::NotSyncing, to = %SyncState::Starting, "sync state");
            self.listener.on_sync_state_changed(SyncState::Starting);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut control = self.control();
            let token = CancellationToken::new();
            control.loop_token = token.clone();
            control.retry_count = 0;
            control.sync_id = None;
            let this = Arc::clone(self);
            control.loop_handle = Some(tokio::spawn(
                this.run_loop(tx, token).instrument(self.span.clone()),
            ));
        }
        info!(parent: &self.span, "sync starting");
        rx.await.unwrap_or(Ok(()))
    }

    /// Stop syncing and wait for the loop to exit.
    ///
    /// Asks the server to close the subscription, gives the loop
    /// `stop_timeout` to see the close, then cuts the read. When this
    /// returns no further mutation happens.
    pub async fn stop_sync(&self) {
        let state = self.state();
        if state == SyncState::Canceling {
            debug!(parent: &self.span, "stop already in progress, waiting for the loop");
            self.wait_for_loop_exit().await;
            return;
        }
        if !state.can_transition_to(SyncState::Canceling) {
            warn!(parent: &self.span, state = %state, "stop_sync called from invalid state");
            return;
        }
        let (sync_id, handle, token) = {
            let mut control = self.control();
            (
                control.sync_id.clone(),
                control.loop_handle.take(),
                control.loop_token.clone(),
            )
        };
        if self.transition(SyncState::Canceling).is_err() {
            // Lost the race to another stop.
            self.wait_for_loop_exit().await;
            return;
        }
        self.release_retry_wait();

        // A start still spawning its loop: the loop sees Canceling and
        // tears down on its own.
        let Some(mut handle) = handle else {
            self.wait_for_loop_exit().await;
            info!(parent: &self.span, "sync stopped");
            return;
        };

        if let Some(sync_id) = sync_id {
            let cancel = self.transport.cancel_subscription(&sync_id);
            match tokio::time::timeout(self.config.stop_timeout, cancel).await {
                Ok(Ok(())) => debug!(parent: &self.span, %sync_id, "cancel sent"),
                Ok(Err(err)) => warn!(parent: &self.span, %sync_id, error = %err, "cancel failed"),
                Err(_) => warn!(parent: &self.span, %sync_id, "cancel timed out"),
            }
        }

        match tokio::time::timeout(self.config.stop_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(parent: &self.span, error = %err, "sync loop failed"),
            Err(_) => {
                info!(parent: &self.span, "forcing the subscription read to stop");
                token.cancel();
                if let Err(err) = handle.await {
                    error!(parent: &self.span, error = %err, "sync loop failed");
                }
            }
        }
        token.cancel();
        info!(parent: &self.span, "sync stopped");
    }

    /// Wait for a stop started elsewhere to finish tearing down.
    async fn wait_for_loop_exit(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SyncState::NotSyncing).await;
    }

    /// Add a registered stream to the subscription.
    ///
    /// While syncing this is an RPC; otherwise the new cookie is simply
    /// picked up by the next subscription. Terminal RPC failures (a bad
    /// cookie) reach the caller, others are logged.
    pub async fn add_stream_to_sync(&self, cookie: SyncCookie) -> Result<()> {
        let stream_id = cookie.stream_id;
        self.wait_for_settled_state().await;

        let Some(view) = self.get(&stream_id).await else {
            error!(parent: &self.span, %stream_id, "add_stream_to_sync: stream not registered");
            return Ok(());
        };
        view.lock().await.set_sync_cookie(cookie.clone());

        let sync_id = self.sync_id();
        match (self.state(), sync_id) {
            (SyncState::Syncing, Some(sync_id)) => {
                match self.transport.add_to_subscription(&sync_id, cookie).await {
                    Ok(()) => {
                        debug!(parent: &self.span, %stream_id, "stream added to sync");
                        Ok(())
                    }
                    Err(err) if err.class() == ErrorClass::Terminal => {
                        error!(parent: &self.span, %stream_id, error = %err, "add_to_subscription rejected");
                        Err(err)
                    }
                    Err(err) => {
                        error!(parent: &self.span, %stream_id, error = %err, "add_to_subscription failed");
                        Ok(())
                    }
                }
            }
            _ => Ok(()),
        }
    }

    /// Stop tracking a stream, removing it from a live subscription.
    pub async fn remove_stream_from_sync(&self, stream_id: &StreamId) -> Result<()> {
        self.wait_for_settled_state().await;

        if !self.has(stream_id).await {
            debug!(parent: &self.span, %stream_id, "remove_stream_from_sync: not registered");
            return Ok(());
        }

        let sync_id = self.sync_id();
        if let (SyncState::Syncing, Some(sync_id)) = (self.state(), sync_id) {
            if let Err(err) = self
                .transport
                .remove_from_subscription(&sync_id, stream_id)
                .await
            {
                error!(parent: &self.span, %stream_id, error = %err, "remove_from_subscription failed");
            }
        }

        self.delete(stream_id).await;
        self.listener.on_stream_removed_from_sync(stream_id);
        Ok(())
    }

    /// Network reachability changed. Going offline parks a pending retry
    /// wait; coming back online resubscribes immediately.
    pub fn on_network_status_changed(&self, is_online: bool) {
        let was_online = self.online.send_replace(is_online);
        info!(parent: &self.span, online = is_online, "network status changed");
        if is_online && !was_online {
            self.release_retry_wait();
        }
    }

    /// App visibility changed. Backgrounding leaves a retry wait alone;
    /// foregrounding cuts it short.
    pub fn on_app_backgrounded(&self, backgrounded: bool) {
        self.control().backgrounded = backgrounded;
        debug!(parent: &self.span, backgrounded, "app visibility changed");
        if !backgrounded {
            self.release_retry_wait();
        }
    }

    fn release_retry_wait(&self) {
        let release = self.control().retry_release.take();
        if let Some(release) = release {
            debug!(parent: &self.span, "retry wait released");
            release.cancel();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Push loop
    // ─────────────────────────────────────────────────────────────────────────

    async fn run_loop(
        self: Arc<Self>,
        first: oneshot::Sender<Result<()>>,
        token: CancellationToken,
    ) {
        let mut first: FirstOutcome = Some(first);
        let mut iteration = 0u64;

        while self.state().is_active() {
            iteration += 1;
            debug!(iteration, state = %self.state(), "sync iteration");

            let cookies = self.current_cookies().await;
            {
                let mut control = self.control();
                control.sync_id = None;
                control.subscribed = cookies.iter().map(|c| c.stream_id).collect();
            }

            let mut keepalive = Keepalive::new(&self.config);
            let result = self
                .run_subscription(cookies, &mut first, &mut keepalive, &token)
                .await;
            keepalive.stop();

            match result {
                Ok(()) => break,
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, "sync loop error");
                    let wait = self.enter_retrying();
                    resolve(&mut first, Ok(()));
                    if let Some((delay, release)) = wait {
                        self.wait_for_retry(delay, release).await;
                    }
                }
                Err(err) => {
                    error!(error = %err, "sync loop terminated");
                    if self.state().can_transition_to(SyncState::Canceling) {
                        let _ = self.transition(SyncState::Canceling);
                    }
                    resolve(&mut first, Err(err));
                    break;
                }
            }
        }

        self.finish_loop(iteration, &token).await;
        resolve(&mut first, Ok(()));
    }

    async fn run_subscription(
        self: &Arc<Self>,
        cookies: Vec<SyncCookie>,
        first: &mut FirstOutcome,
        keepalive: &mut Keepalive,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut responses = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            opened = self.transport.start_subscription(cookies) => opened?,
        };

        loop {
            let deadline = keepalive.deadline();
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("subscription read stopped");
                    return Ok(());
                }
                _ = sleep_until(deadline) => {
                    if let KeepaliveAction::Ping(nonce) = keepalive.on_deadline(Instant::now())? {
                        self.send_ping(&nonce).await?;
                    }
                }
                next = responses.recv() => match next {
                    Some(Ok(response)) => self.handle_response(response, first, keepalive).await?,
                    Some(Err(err)) if self.state() != SyncState::Canceling => return Err(err),
                    Some(Err(_)) => return Ok(()),
                    None if self.state() != SyncState::Canceling => {
                        return Err(SyncError::Transport("subscription ended".into()));
                    }
                    None => return Ok(()),
                },
            }
            if self.state() == SyncState::Canceling {
                return Ok(());
            }
        }
    }

    async fn handle_response(
        self: &Arc<Self>,
        response: SyncResponse,
        first: &mut FirstOutcome,
        keepalive: &mut Keepalive,
    ) -> Result<()> {
        let SyncResponse { sync_id, op } = response;
        match op {
            SyncOp::New => {
                self.sync_started(sync_id.clone(), keepalive);
                resolve(first, Ok(()));
                if self.sync_id().as_ref() == Some(&sync_id) {
                    self.add_late_streams(&sync_id).await;
                }
                Ok(())
            }
            _ if self.sync_id().as_ref() != Some(&sync_id) => {
                debug!(%sync_id, "dropping response for another subscription");
                Ok(())
            }
            SyncOp::Close => {
                keepalive.stop();
                if self.state() == SyncState::Canceling {
                    info!(%sync_id, "server acknowledged close");
                    Ok(())
                } else {
                    Err(SyncError::ServerClosed)
                }
            }
            SyncOp::Update(update) => {
                self.on_update(update).await;
                Ok(())
            }
            SyncOp::Pong { nonce } => {
                keepalive.on_pong(&nonce, Instant::now());
                Ok(())
            }
            SyncOp::Down { stream_id } => {
                debug!(%stream_id, "stream down");
                self.spawn_readd(stream_id, sync_id);
                Ok(())
            }
        }
    }

    fn sync_started(&self, sync_id: SyncId, keepalive: &mut Keepalive) {
        let already = self.control().sync_id.is_some();
        if already || !self.state().can_transition_to(SyncState::Syncing) {
            warn!(%sync_id, state = %self.state(), "unexpected subscription confirmation");
            return;
        }
        let previous_retries = {
            let mut control = self.control();
            control.sync_id = Some(sync_id.clone());
            std::mem::replace(&mut control.retry_count, 0)
        };
        if self.transition(SyncState::Syncing).is_err() {
            let mut control = self.control();
            control.sync_id = None;
            control.retry_count = previous_retries;
            return;
        }
        keepalive.start();
        info!(%sync_id, "sync started");
        self.listener.on_sync_active(true);
    }

    async fn send_ping(&self, nonce: &str) -> Result<()> {
        let Some(sync_id) = self.sync_id() else {
            return Ok(());
        };
        if self.state() != SyncState::Syncing {
            return Ok(());
        }
        match tokio::time::timeout(
            self.config.pong_timeout,
            self.transport.ping(&sync_id, nonce),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout("ping".into())),
        }
    }

    /// Route one update to its stream.
    async fn on_update(&self, update: StreamUpdate) {
        let state = self.state();
        if !matches!(state, SyncState::Syncing | SyncState::Canceling) {
            debug!(state = %state, "dropping update outside of sync");
            return;
        }
        let stream_id = *update.stream_id();
        let Some(view) = self.get(&stream_id).await else {
            warn!(%stream_id, "dropping update for unknown stream");
            return;
        };

        let StreamUpdate {
            next_cookie,
            reset,
            events,
            miniblock,
        } = update;
        let outcome = {
            let mut view = view.lock().await;
            match reset {
                Some(snapshot) => {
                    info!(%stream_id, miniblock_num = snapshot.miniblock_num, "sync reset");
                    view.reinitialize(snapshot);
                    view.set_sync_cookie(next_cookie);
                    ApplyOutcome::Applied
                }
                None => view.apply_update(next_cookie, events, miniblock, Some(self.listener.as_ref())),
            }
        };

        match outcome {
            ApplyOutcome::Applied => {}
            ApplyOutcome::Duplicate => debug!(%stream_id, "duplicate miniblock ignored"),
            ApplyOutcome::Gap { expected, got } => {
                warn!(%stream_id, expected, got, "miniblock gap, refetching stream");
                self.refetch(&stream_id, &view).await;
            }
        }

        self.after_update(&stream_id, &view).await;
    }

    async fn refetch(&self, stream_id: &StreamId, view: &SharedView) {
        match self.transport.get_stream(stream_id).await {
            Ok(snapshot) => view.lock().await.reinitialize(snapshot),
            Err(err) => error!(%stream_id, error = %err, "refetch failed"),
        }
    }

    /// Decrypt what the update queued, then persist the view.
    async fn after_update(&self, stream_id: &StreamId, view: &SharedView) {
        if let Some(decryptor) = &self.decryptor {
            let requests = view.lock().await.take_decryption_requests();
            for request in requests {
                let encrypted = &request.encrypted;
                match decryptor
                    .decrypt(stream_id, &encrypted.session_id, &encrypted.ciphertext)
                    .await
                {
                    Ok(plaintext) => {
                        let mut view = view.lock().await;
                        if let Err(err) = view.on_decrypted_content(
                            request.event_id,
                            &plaintext,
                            Some(self.listener.as_ref()),
                        ) {
                            warn!(%stream_id, error = %err, "decrypted content rejected");
                        }
                    }
                    Err(err) => {
                        warn!(%stream_id, session_id = %encrypted.session_id, error = %err, "decryption failed")
                    }
                }
            }
        }

        if let Some(persistence) = &self.persistence {
            let view = view.lock().await;
            if let Err(err) = persistence.save_stream(stream_id, &view).await {
                warn!(%stream_id, error = %err, "failed to persist stream");
            }
        }
    }

    /// Add streams registered after the cookies of this subscription were
    /// taken. Their registrants saw a non-syncing state and sent nothing.
    async fn add_late_streams(self: &Arc<Self>, sync_id: &SyncId) {
        let subscribed = std::mem::take(&mut self.control().subscribed);
        for stream_id in self.get_stream_ids().await {
            if !subscribed.contains(&stream_id) {
                debug!(%stream_id, "stream registered while subscribing, adding");
                self.spawn_readd(stream_id, sync_id.clone());
            }
        }
    }

    /// Re-add just `stream_id`, with its own backoff, for as long as the
    /// subscription `sync_id` lives.
    fn spawn_readd(self: &Arc<Self>, stream_id: StreamId, sync_id: SyncId) {
        let token = self.control().loop_token.child_token();
        let this = Arc::clone(self);
        tokio::spawn(
            async move { this.readd_stream(stream_id, sync_id, token).await }
                .instrument(self.span.clone()),
        );
    }

    async fn readd_stream(&self, stream_id: StreamId, sync_id: SyncId, token: CancellationToken) {
        let mut attempt = 0u32;
        loop {
            let current = self.sync_id();
            if current.as_ref() != Some(&sync_id) || self.state() != SyncState::Syncing {
                debug!(%stream_id, "re-add: subscription changed, giving up");
                return;
            }
            let Some(view) = self.get(&stream_id).await else {
                debug!(%stream_id, "re-add: stream not registered");
                return;
            };
            let cookie = view.lock().await.sync_cookie().clone();
            match self.transport.add_to_subscription(&sync_id, cookie).await {
                Ok(()) => {
                    debug!(%stream_id, attempt, "stream re-added");
                    return;
                }
                Err(err) => {
                    let delay = stream_down_delay(&self.config, attempt);
                    warn!(
                        %stream_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "re-adding stream failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return,
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Enter Retrying and bump the retry counter.
    ///
    /// Returns the backoff to wait out and the token that releases it early,
    /// or `None` when there is nothing to wait for.
    fn enter_retrying(&self) -> Option<(Duration, CancellationToken)> {
        let state = self.state();
        if !state.can_transition_to(SyncState::Retrying) {
            error!(state = %state, "cannot enter Retrying");
            return None;
        }

        let release = CancellationToken::new();
        let retry_count = {
            let mut control = self.control();
            control.retry_count = next_retry_count(control.retry_count, self.config.max_retry_exponent);
            control.retry_release = Some(release.clone());
            control.retry_count
        };

        if state != SyncState::Retrying {
            if self.transition(SyncState::Retrying).is_err() {
                return None;
            }
            self.control().sync_id = None;
            self.listener.on_sync_active(false);
        }

        // A stop that raced with the transition above has already tried to
        // release the wait.
        if self.state() == SyncState::Canceling {
            return None;
        }

        let delay = retry_delay(&self.config, retry_count);
        info!(retry_count, delay_ms = delay.as_millis() as u64, "sync error, retrying");
        Some((delay, release))
    }

    /// Wait out the backoff unless a stop, a foreground or the network
    /// coming back releases it first.
    async fn wait_for_retry(&self, delay: Duration, release: CancellationToken) {
        let mut online = self.online.subscribe();
        let outcome = backoff_wait(delay, &release, &mut online).await;
        debug!(?outcome, "retry wait over");
        self.control().retry_release = None;
    }

    /// Loop exit: Canceling -> NotSyncing and registry teardown.
    async fn finish_loop(&self, iteration: u64, token: &CancellationToken) {
        token.cancel();
        if self.state().can_transition_to(SyncState::NotSyncing) {
            let _ = self.transition(SyncState::NotSyncing);
        } else {
            error!(state = %self.state(), "sync loop ended outside of Canceling");
        }
        self.streams.write().await.clear();
        {
            let mut control = self.control();
            control.sync_id = None;
            control.retry_release = None;
        }
        self.listener.on_sync_active(false);
        info!(iteration, "sync loop stopped");
    }

    #[cfg(test)]
    fn force_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }
}

fn resolve(first: &mut FirstOutcome, result: Result<()>) {
    if let Some(tx) = first.take() {
        let _ = tx.send(result);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
