//! In-memory implementation of the Persistence trait.
//!
//! Views are stored encoded, exactly as SQLite stores them, so a load
//! always goes through replay.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use streamsync_core::StreamId;
use streamsync_state::StreamStateView;

use crate::error::Result;
use crate::traits::{decode_view, encode_view, Persistence};

/// In-memory store. All data is lost when the store is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    streams: RwLock<BTreeMap<StreamId, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored streams.
    pub fn len(&self) -> usize {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn load_stream(&self, stream_id: &StreamId) -> Result<Option<StreamStateView>> {
        let bytes = self
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_id)
            .cloned();
        bytes.map(|b| decode_view(&b)).transpose()
    }

    async fn save_stream(&self, stream_id: &StreamId, view: &StreamStateView) -> Result<()> {
        let bytes = encode_view(view)?;
        self.streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*stream_id, bytes);
        Ok(())
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> Result<()> {
        self.streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_id);
        Ok(())
    }

    async fn stream_ids(&self) -> Result<Vec<StreamId>> {
        Ok(self
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamsync_core::SyncCookie;

    fn stream(n: u8) -> StreamId {
        StreamId::space(&[n; 20])
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemoryStore::new();
        assert!(store.load_stream(&stream(1)).await.unwrap().is_none());

        let mut view = StreamStateView::empty(stream(1));
        view.set_sync_cookie(SyncCookie::new(stream(1), 4));
        store.save_stream(&stream(1), &view).await.unwrap();

        let loaded = store.load_stream(&stream(1)).await.unwrap().unwrap();
        assert_eq!(loaded.sync_cookie().miniblock_num, 4);
        assert!(loaded.membership().participants().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let store = MemoryStore::new();
        store.save_stream(&stream(2), &StreamStateView::empty(stream(2))).await.unwrap();
        store.save_stream(&stream(1), &StreamStateView::empty(stream(1))).await.unwrap();
        assert_eq!(store.stream_ids().await.unwrap(), vec![stream(1), stream(2)]);

        store.delete_stream(&stream(1)).await.unwrap();
        store.delete_stream(&stream(9)).await.unwrap();
        assert_eq!(store.stream_ids().await.unwrap(), vec![stream(2)]);
    }
}
