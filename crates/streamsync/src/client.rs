//! The client: one registry, one loader, one limiter, one store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use streamsync_core::{InitStatus, StreamId, StreamListener, SyncState, UserId};
use streamsync_state::{Decryptor, StreamMember, StreamStateView};
use streamsync_store::Persistence;
use streamsync_sync::{
    BootstrapConfig, BootstrapLoader, ConcurrencyLimiter, LoadCounters, SharedView, SyncConfig,
    SyncRegistry, SyncTransport,
};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

/// Configuration for the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Live subscription settings.
    pub sync: SyncConfig,
    /// Bulk loading settings.
    pub bootstrap: BootstrapConfig,
}

impl ClientConfig {
    /// Parse from JSON. Missing fields take their defaults; durations are
    /// given in milliseconds (`ping_interval_ms`, `retry_base_ms`, ...).
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Builder for [`SyncClient`].
pub struct SyncClientBuilder<T: SyncTransport> {
    transport: Arc<T>,
    persistence: Arc<dyn Persistence>,
    config: ClientConfig,
    listener: Option<Arc<dyn StreamListener>>,
    decryptor: Option<Arc<dyn Decryptor>>,
    user: Option<UserId>,
}

impl<T: SyncTransport> SyncClientBuilder<T> {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StreamListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// The signed-in user, recorded on every log record of the registry.
    pub fn user(mut self, user: UserId) -> Self {
        self.user = Some(user);
        self
    }

    pub fn build(self) -> SyncClient<T> {
        let span = match &self.user {
            Some(user) => tracing::info_span!("sync_registry", user = %user),
            None => tracing::info_span!("sync_registry"),
        };

        let mut registry = SyncRegistry::new(self.transport, self.config.sync.clone())
            .with_persistence(Arc::clone(&self.persistence))
            .with_span(span);
        if let Some(listener) = self.listener {
            registry = registry.with_listener(listener);
        }
        if let Some(decryptor) = self.decryptor {
            registry = registry.with_decryptor(decryptor);
        }
        let registry = Arc::new(registry);

        let limiter = ConcurrencyLimiter::new(self.config.bootstrap.concurrency_limit);
        let loader = Arc::new(BootstrapLoader::new(
            Arc::clone(&registry),
            Arc::clone(&self.persistence),
            limiter.clone(),
        ));

        SyncClient {
            config: self.config,
            limiter,
            registry,
            loader,
            persistence: self.persistence,
        }
    }
}

/// The main client.
///
/// Loads streams at startup, keeps them live over one subscription, and
/// answers ad hoc fetches, all through one shared concurrency limiter.
pub struct SyncClient<T: SyncTransport> {
    config: ClientConfig,
    limiter: ConcurrencyLimiter,
    registry: Arc<SyncRegistry<T>>,
    loader: Arc<BootstrapLoader<T>>,
    persistence: Arc<dyn Persistence>,
}

impl<T: SyncTransport> SyncClient<T> {
    /// Create a client with default collaborators.
    pub fn new(transport: Arc<T>, persistence: Arc<dyn Persistence>, config: ClientConfig) -> Self {
        Self::builder(transport, persistence).config(config).build()
    }

    pub fn builder(transport: Arc<T>, persistence: Arc<dyn Persistence>) -> SyncClientBuilder<T> {
        SyncClientBuilder {
            transport,
            persistence,
            config: ClientConfig::default(),
            listener: None,
            decryptor: None,
            user: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SyncRegistry<T>> {
        &self.registry
    }

    pub fn loader(&self) -> &Arc<BootstrapLoader<T>> {
        &self.loader
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Name the streams to load, and which of them to load first.
    /// May be called once.
    pub fn init_streams(&self, ids: Vec<StreamId>, high_priority: Vec<StreamId>) -> Result<()> {
        self.loader.set_stream_ids(ids)?;
        self.loader.set_high_priority(high_priority)?;
        Ok(())
    }

    /// Begin loading. May be called once.
    pub fn start_bootstrap(&self) -> Result<()> {
        Ok(self.loader.start()?)
    }

    /// Start sync once loading finishes (or now, if it already has).
    pub fn request_sync(&self) {
        self.loader.set_start_sync_requested(true);
    }

    /// Wait for loading to finish.
    pub async fn wait_bootstrapped(&self) {
        self.loader.wait_drained().await;
    }

    /// Stop loading, then stop syncing.
    pub async fn stop(&self) {
        self.loader.stop().await;
        self.registry.stop_sync().await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Streams
    // ─────────────────────────────────────────────────────────────────────────

    /// A registered stream.
    pub async fn stream(&self, stream_id: &StreamId) -> Option<SharedView> {
        self.registry.get(stream_id).await
    }

    /// Fetch a stream from the network, register it, and add it to a live
    /// sync. Returns the registered view if there already is one.
    pub async fn fetch_stream(&self, stream_id: StreamId) -> Result<SharedView> {
        if let Some(view) = self.registry.get(&stream_id).await {
            debug!(%stream_id, "fetch_stream: already registered");
            return Ok(view);
        }

        let snapshot = self
            .limiter
            .run(self.registry.transport().get_stream(&stream_id))
            .await??;
        let view = StreamStateView::from_snapshot(snapshot);
        if let Err(err) = self.persistence.save_stream(&stream_id, &view).await {
            warn!(%stream_id, error = %err, "failed to persist fetched stream");
        }

        let cookie = view.sync_cookie().clone();
        let shared = self.registry.set(stream_id, view).await;
        if self.registry.state() == SyncState::Syncing {
            self.registry.add_stream_to_sync(cookie).await?;
        }
        Ok(shared)
    }

    /// Stop tracking a stream.
    pub async fn remove_stream(&self, stream_id: &StreamId) -> Result<()> {
        Ok(self.registry.remove_stream_from_sync(stream_id).await?)
    }

    /// Joined members of a registered stream with their attributes.
    pub async fn members(&self, stream_id: &StreamId) -> Result<Vec<StreamMember>> {
        let view = self
            .registry
            .get(stream_id)
            .await
            .ok_or(ClientError::StreamNotFound(*stream_id))?;
        let members = view.lock().await.members();
        Ok(members)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Environment
    // ─────────────────────────────────────────────────────────────────────────

    pub fn on_network_status_changed(&self, online: bool) {
        self.registry.on_network_status_changed(online);
    }

    pub fn on_app_backgrounded(&self, backgrounded: bool) {
        self.registry.on_app_backgrounded(backgrounded);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    pub fn init_status(&self) -> InitStatus {
        self.loader.status()
    }

    pub fn load_counters(&self) -> LoadCounters {
        self.loader.counters()
    }

    pub fn sync_state(&self) -> SyncState {
        self.registry.state()
    }
}
