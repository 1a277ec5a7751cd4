//! SQLite implementation of the Persistence trait.
//!
//! rusqlite with bundled SQLite, driven from async code through
//! `tokio::task::spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use streamsync_core::StreamId;
use streamsync_state::StreamStateView;

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::{decode_view, encode_view, Persistence};

/// SQLite-backed stream store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn load_stream(&self, stream_id: &StreamId) -> Result<Option<StreamStateView>> {
        let key = stream_id.as_bytes().to_vec();
        let bytes: Option<Vec<u8>> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT state FROM streams WHERE stream_id = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        bytes.map(|b| decode_view(&b)).transpose()
    }

    async fn save_stream(&self, stream_id: &StreamId, view: &StreamStateView) -> Result<()> {
        let key = stream_id.as_bytes().to_vec();
        let state = encode_view(view)?;
        let miniblock_num = i64::try_from(view.miniblock_num())
            .map_err(|_| StoreError::InvalidData("miniblock number overflows i64".into()))?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO streams (stream_id, miniblock_num, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(stream_id) DO UPDATE SET
                    miniblock_num = excluded.miniblock_num,
                    state = excluded.state,
                    updated_at = excluded.updated_at",
                params![key, miniblock_num, state, now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> Result<()> {
        let key = stream_id.as_bytes().to_vec();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM streams WHERE stream_id = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn stream_ids(&self) -> Result<Vec<StreamId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT stream_id FROM streams ORDER BY stream_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                let bytes: [u8; 32] = row?
                    .try_into()
                    .map_err(|_| StoreError::InvalidData("stream id is not 32 bytes".into()))?;
                ids.push(StreamId::from_bytes(bytes));
            }
            Ok(ids)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamsync_core::{
        EventPayload, MembershipOp, MiniblockHeader, StreamEvent, SyncCookie, UserId,
    };

    fn stream() -> StreamId {
        StreamId::space(&[3; 20])
    }

    fn joined_view() -> StreamStateView {
        let mut view = StreamStateView::empty(stream());
        let user = UserId::from_bytes([1; 20]);
        let join = StreamEvent::new(
            user,
            10,
            EventPayload::Membership {
                user,
                op: MembershipOp::Join,
            },
        )
        .unwrap();
        view.confirm_miniblock(
            MiniblockHeader {
                miniblock_num: 1,
                events: vec![join],
            },
            None,
        );
        view.set_sync_cookie(SyncCookie::new(stream(), 1).with_minipool_gen(3));
        view
    }

    #[tokio::test]
    async fn test_save_load_overwrite() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(store.load_stream(&stream()).await.unwrap().is_none());

        store.save_stream(&stream(), &StreamStateView::empty(stream())).await.unwrap();
        store.save_stream(&stream(), &joined_view()).await.unwrap();

        let loaded = store.load_stream(&stream()).await.unwrap().unwrap();
        assert_eq!(loaded.miniblock_num(), 1);
        assert_eq!(loaded.sync_cookie().minipool_gen, 3);
        assert_eq!(loaded.membership().joined_participants().len(), 1);
        assert_eq!(store.stream_ids().await.unwrap(), vec![stream()]);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_stream(&stream(), &joined_view()).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.load_stream(&stream()).await.unwrap().unwrap();
        assert_eq!(loaded.confirmed_events().len(), 1);

        store.delete_stream(&stream()).await.unwrap();
        assert!(store.load_stream(&stream()).await.unwrap().is_none());
    }
}
