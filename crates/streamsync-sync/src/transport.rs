//! Transport abstraction for the subscription RPCs.
//!
//! Wire encoding lives behind this trait. A subscription is a channel of
//! responses; the server's first message on it is `SyncOp::New`, which
//! carries the sync id used by every other call.

use async_trait::async_trait;
use streamsync_core::{StreamId, StreamSnapshot, SyncCookie, SyncId};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::messages::SyncResponse;

/// Receiving end of a live subscription. `None` means the server ended it.
pub type ResponseStream = mpsc::Receiver<Result<SyncResponse>>;

/// RPC surface the engine needs from the network.
#[async_trait]
pub trait SyncTransport: Send + Sync + 'static {
    /// Open a subscription seeded with `cookies`.
    async fn start_subscription(&self, cookies: Vec<SyncCookie>) -> Result<ResponseStream>;

    /// Add one stream to a live subscription.
    async fn add_to_subscription(&self, sync_id: &SyncId, cookie: SyncCookie) -> Result<()>;

    /// Remove one stream from a live subscription.
    async fn remove_from_subscription(&self, sync_id: &SyncId, stream_id: &StreamId)
        -> Result<()>;

    /// Ask the server to close the subscription.
    async fn cancel_subscription(&self, sync_id: &SyncId) -> Result<()>;

    /// Keepalive. The server answers with `SyncOp::Pong { nonce }` on the
    /// subscription itself.
    async fn ping(&self, sync_id: &SyncId, nonce: &str) -> Result<()>;

    /// Fetch a full snapshot of one stream.
    async fn get_stream(&self, stream_id: &StreamId) -> Result<StreamSnapshot>;
}

/// A scripted in-memory transport for tests.
///
/// Every call is recorded. Tests push responses onto the current
/// subscription, inject failures, and inspect what the engine asked for.
pub mod memory {
    use super::*;
    use crate::error::SyncError;
    use crate::messages::SyncOp;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::{Mutex, MutexGuard, PoisonError};

    /// One recorded call.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum TransportCall {
        StartSubscription(Vec<SyncCookie>),
        AddToSubscription(SyncId, SyncCookie),
        RemoveFromSubscription(SyncId, StreamId),
        CancelSubscription(SyncId),
        Ping(SyncId, String),
        GetStream(StreamId),
    }

    #[derive(Default)]
    struct Inner {
        calls: Vec<TransportCall>,
        subscriptions: u64,
        current: Option<(SyncId, mpsc::Sender<Result<SyncResponse>>)>,
        start_failures: VecDeque<SyncError>,
        add_failures: VecDeque<SyncError>,
        ping_failures: VecDeque<SyncError>,
        snapshots: HashMap<StreamId, StreamSnapshot>,
        missing_streams: HashSet<StreamId>,
        hold_start: bool,
        silent_pings: bool,
        ignore_cancel: bool,
    }

    /// Scripted transport. Cheap to share behind an `Arc`.
    #[derive(Default)]
    pub struct ScriptedTransport {
        inner: Mutex<Inner>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }

        // ─────────────────────────────────────────────────────────────────
        // Scripting
        // ─────────────────────────────────────────────────────────────────

        /// Fail the next `start_subscription` with `err`.
        pub fn fail_next_start(&self, err: SyncError) {
            self.lock().start_failures.push_back(err);
        }

        /// Fail the next `add_to_subscription` with `err`.
        pub fn fail_next_add(&self, err: SyncError) {
            self.lock().add_failures.push_back(err);
        }

        /// Fail the next `ping` with `err`.
        pub fn fail_next_ping(&self, err: SyncError) {
            self.lock().ping_failures.push_back(err);
        }

        /// Do not send `New` when a subscription opens; tests send it
        /// themselves with [`Self::confirm_subscription`].
        pub fn hold_start(&self, hold: bool) {
            self.lock().hold_start = hold;
        }

        /// Accept pings without answering them.
        pub fn silent_pings(&self, silent: bool) {
            self.lock().silent_pings = silent;
        }

        /// Accept cancel calls without closing the subscription.
        pub fn ignore_cancel(&self, ignore: bool) {
            self.lock().ignore_cancel = ignore;
        }

        /// Snapshot returned by `get_stream` for `stream_id`.
        pub fn set_snapshot(&self, snapshot: StreamSnapshot) {
            self.lock().snapshots.insert(snapshot.stream_id, snapshot);
        }

        /// Make `get_stream` fail for `stream_id`.
        pub fn set_missing(&self, stream_id: StreamId) {
            self.lock().missing_streams.insert(stream_id);
        }

        /// Send `New` on the current subscription.
        pub async fn confirm_subscription(&self) -> bool {
            self.push(SyncOp::New).await
        }

        /// Push `op` on the current subscription under its sync id.
        pub async fn push(&self, op: SyncOp) -> bool {
            let current = self.lock().current.clone();
            match current {
                Some((sync_id, tx)) => tx.send(Ok(SyncResponse::new(sync_id, op))).await.is_ok(),
                None => false,
            }
        }

        /// Push a response as is, whatever its sync id.
        pub async fn push_raw(&self, response: SyncResponse) -> bool {
            let tx = self.lock().current.as_ref().map(|(_, tx)| tx.clone());
            match tx {
                Some(tx) => tx.send(Ok(response)).await.is_ok(),
                None => false,
            }
        }

        /// Deliver `err` on the subscription and drop it.
        pub async fn fail_connection(&self, err: SyncError) -> bool {
            let current = self.lock().current.take();
            match current {
                Some((_, tx)) => tx.send(Err(err)).await.is_ok(),
                None => false,
            }
        }

        /// End the subscription without a message.
        pub fn drop_connection(&self) {
            self.lock().current = None;
        }

        // ─────────────────────────────────────────────────────────────────
        // Inspection
        // ─────────────────────────────────────────────────────────────────

        pub fn calls(&self) -> Vec<TransportCall> {
            self.lock().calls.clone()
        }

        /// Cookie sets of every `start_subscription`, in order.
        pub fn start_calls(&self) -> Vec<Vec<SyncCookie>> {
            self.lock()
                .calls
                .iter()
                .filter_map(|c| match c {
                    TransportCall::StartSubscription(cookies) => Some(cookies.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, pred: impl Fn(&TransportCall) -> bool) -> usize {
            self.lock().calls.iter().filter(|c| pred(c)).count()
        }

        /// Sync id of the open subscription, if any.
        pub fn current_sync_id(&self) -> Option<SyncId> {
            self.lock().current.as_ref().map(|(id, _)| id.clone())
        }

        pub fn is_connected(&self) -> bool {
            self.lock()
                .current
                .as_ref()
                .map(|(_, tx)| !tx.is_closed())
                .unwrap_or(false)
        }
    }

    #[async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn start_subscription(&self, cookies: Vec<SyncCookie>) -> Result<ResponseStream> {
            let (tx, rx) = mpsc::channel(1024);
            let (sync_id, hold) = {
                let mut inner = self.lock();
                inner.calls.push(TransportCall::StartSubscription(cookies));
                if let Some(err) = inner.start_failures.pop_front() {
                    return Err(err);
                }
                inner.subscriptions += 1;
                let sync_id = SyncId::new(format!("sync-{}", inner.subscriptions));
                inner.current = Some((sync_id.clone(), tx.clone()));
                (sync_id, inner.hold_start)
            };
            if !hold {
                let _ = tx.send(Ok(SyncResponse::new(sync_id, SyncOp::New))).await;
            }
            Ok(rx)
        }

        async fn add_to_subscription(&self, sync_id: &SyncId, cookie: SyncCookie) -> Result<()> {
            let mut inner = self.lock();
            inner
                .calls
                .push(TransportCall::AddToSubscription(sync_id.clone(), cookie));
            match inner.add_failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn remove_from_subscription(
            &self,
            sync_id: &SyncId,
            stream_id: &StreamId,
        ) -> Result<()> {
            self.lock()
                .calls
                .push(TransportCall::RemoveFromSubscription(sync_id.clone(), *stream_id));
            Ok(())
        }

        async fn cancel_subscription(&self, sync_id: &SyncId) -> Result<()> {
            let closing = {
                let mut inner = self.lock();
                inner.calls.push(TransportCall::CancelSubscription(sync_id.clone()));
                let matches = inner
                    .current
                    .as_ref()
                    .map(|(id, _)| id == sync_id)
                    .unwrap_or(false);
                if matches && !inner.ignore_cancel {
                    inner.current.take()
                } else {
                    None
                }
            };
            if let Some((id, tx)) = closing {
                let _ = tx.send(Ok(SyncResponse::new(id, SyncOp::Close))).await;
            }
            Ok(())
        }

        async fn ping(&self, sync_id: &SyncId, nonce: &str) -> Result<()> {
            let reply = {
                let mut inner = self.lock();
                inner
                    .calls
                    .push(TransportCall::Ping(sync_id.clone(), nonce.to_string()));
                if let Some(err) = inner.ping_failures.pop_front() {
                    return Err(err);
                }
                if inner.silent_pings {
                    None
                } else {
                    inner.current.clone()
                }
            };
            if let Some((id, tx)) = reply {
                let pong = SyncOp::Pong {
                    nonce: nonce.to_string(),
                };
                let _ = tx.send(Ok(SyncResponse::new(id, pong))).await;
            }
            Ok(())
        }

        async fn get_stream(&self, stream_id: &StreamId) -> Result<StreamSnapshot> {
            let mut inner = self.lock();
            inner.calls.push(TransportCall::GetStream(*stream_id));
            if inner.missing_streams.contains(stream_id) {
                return Err(SyncError::StreamNotFound(*stream_id));
            }
            Ok(inner
                .snapshots
                .get(stream_id)
                .cloned()
                .unwrap_or_else(|| StreamSnapshot::empty(*stream_id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{ScriptedTransport, TransportCall};
    use super::*;
    use crate::error::SyncError;
    use crate::messages::SyncOp;

    #[tokio::test]
    async fn test_subscription_opens_with_new() {
        let transport = ScriptedTransport::new();
        let cookie = SyncCookie::new(StreamId::space(&[1; 20]), 0);

        let mut rx = transport.start_subscription(vec![cookie.clone()]).await.unwrap();
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.op, SyncOp::New);
        assert_eq!(transport.current_sync_id(), Some(first.sync_id.clone()));
        assert_eq!(transport.start_calls(), vec![vec![cookie]]);

        transport.cancel_subscription(&first.sync_id).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap().op, SyncOp::Close);
        assert!(rx.recv().await.is_none());
        assert!(transport.calls().contains(&TransportCall::CancelSubscription(first.sync_id)));
    }

    #[tokio::test]
    async fn test_injected_start_failure() {
        let transport = ScriptedTransport::new();
        transport.fail_next_start(SyncError::Unauthorized("banned".into()));
        assert!(matches!(
            transport.start_subscription(vec![]).await,
            Err(SyncError::Unauthorized(_))
        ));
        assert!(transport.start_subscription(vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_ping_echoes_pong() {
        let transport = ScriptedTransport::new();
        let mut rx = transport.start_subscription(vec![]).await.unwrap();
        let sync_id = rx.recv().await.unwrap().unwrap().sync_id;

        transport.ping(&sync_id, "abc").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap().unwrap().op,
            SyncOp::Pong {
                nonce: "abc".into()
            }
        );
    }
}
