//! Persistence trait: where stream views live between sessions.

use async_trait::async_trait;
use streamsync_core::StreamId;
use streamsync_state::StreamStateView;

use crate::error::Result;

/// Async interface for stream persistence.
///
/// A load returns `Ok(None)` when nothing is stored for the id. Saving
/// overwrites whatever was stored, cookie included.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Load a stream view.
    async fn load_stream(&self, stream_id: &StreamId) -> Result<Option<StreamStateView>>;

    /// Store a stream view, replacing any previous one.
    async fn save_stream(&self, stream_id: &StreamId, view: &StreamStateView) -> Result<()>;

    /// Forget a stream. Deleting an unknown id is not an error.
    async fn delete_stream(&self, stream_id: &StreamId) -> Result<()>;

    /// Every stored stream id, sorted.
    async fn stream_ids(&self) -> Result<Vec<StreamId>>;
}

/// Encode a view as CBOR.
pub(crate) fn encode_view(view: &StreamStateView) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(&view.to_persisted(), &mut buf)
        .map_err(|e| crate::StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

/// Decode a view from CBOR by replay.
pub(crate) fn decode_view(bytes: &[u8]) -> Result<StreamStateView> {
    let persisted: streamsync_state::PersistedStream = ciborium::from_reader(bytes)
        .map_err(|e| crate::StoreError::Serialization(e.to_string()))?;
    Ok(StreamStateView::from_persisted(persisted))
}
