//! Messages pushed by the server over a subscription.

use serde::{Deserialize, Serialize};
use streamsync_core::{
    MiniblockHeader, StreamEvent, StreamId, StreamSnapshot, SyncCookie, SyncId,
};

/// One message on the subscription stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Subscription the message belongs to.
    pub sync_id: SyncId,
    pub op: SyncOp,
}

impl SyncResponse {
    pub fn new(sync_id: SyncId, op: SyncOp) -> Self {
        Self { sync_id, op }
    }
}

/// What the server is telling us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOp {
    /// The subscription is established under the response's sync id.
    New,
    /// The server closed the subscription.
    Close,
    /// New data for one stream.
    Update(StreamUpdate),
    /// Echo of a keepalive ping.
    Pong { nonce: String },
    /// The node serving a stream went away.
    Down { stream_id: StreamId },
}

/// Update for one stream. Routed by the stream id in `next_cookie`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamUpdate {
    /// Where to resume from after applying this update.
    pub next_cookie: SyncCookie,
    /// The server reset the stream; rebuild the view from this snapshot.
    pub reset: Option<StreamSnapshot>,
    /// New pending events.
    pub events: Vec<StreamEvent>,
    /// A newly committed miniblock.
    pub miniblock: Option<MiniblockHeader>,
}

impl StreamUpdate {
    /// A cookie-only heartbeat.
    pub fn heartbeat(next_cookie: SyncCookie) -> Self {
        Self {
            next_cookie,
            reset: None,
            events: Vec::new(),
            miniblock: None,
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.next_cookie.stream_id
    }

    pub fn is_heartbeat(&self) -> bool {
        self.reset.is_none() && self.events.is_empty() && self.miniblock.is_none()
    }
}
