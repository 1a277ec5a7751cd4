//! Stream events, miniblock headers and snapshots.
//!
//! Payloads are opaque apart from the handful of member-level variants the
//! reconcilers understand. Encrypted content stays as ciphertext until a
//! decryptor hands back plaintext.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::stream::{StreamId, SyncCookie};
use crate::types::{EventId, UserId};

/// Membership operation carried by a membership event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum MembershipOp {
    Unspecified = 0,
    Invite = 1,
    Join = 2,
    Leave = 3,
}

impl TryFrom<i32> for MembershipOp {
    type Error = CoreError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MembershipOp::Unspecified),
            1 => Ok(MembershipOp::Invite),
            2 => Ok(MembershipOp::Join),
            3 => Ok(MembershipOp::Leave),
            other => Err(CoreError::UnknownMembershipOp(other)),
        }
    }
}

/// Whether an event has been committed to a miniblock yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Confirmation {
    Pending,
    Confirmed,
}

impl Confirmation {
    pub fn is_pending(self) -> bool {
        matches!(self, Confirmation::Pending)
    }
}

/// Ciphertext plus the session it was encrypted under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub session_id: String,
    pub ciphertext: Bytes,
}

impl EncryptedData {
    pub fn new(session_id: impl Into<String>, ciphertext: impl Into<Bytes>) -> Self {
        Self {
            session_id: session_id.into(),
            ciphertext: ciphertext.into(),
        }
    }
}

/// An NFT a member displays as a badge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftBadge {
    pub chain_id: u64,
    pub contract_address: [u8; 20],
    pub token_id: Bytes,
}

/// What an event says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    /// `user` was invited, joined or left.
    Membership { user: UserId, op: MembershipOp },

    /// The creator set an encrypted display name.
    DisplayName(EncryptedData),

    /// The creator linked an external account address.
    LinkedAddress([u8; 20]),

    /// The creator picked an NFT badge.
    Nft(NftBadge),

    /// An encrypted message. Stored, never interpreted.
    Message(EncryptedData),

    /// Anything else the engine carries without looking at.
    Opaque(Bytes),
}

#[derive(Serialize)]
struct EventBody<'a> {
    creator: &'a UserId,
    created_at: i64,
    payload: &'a EventPayload,
}

/// A single event in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Content address of the event.
    pub event_id: EventId,

    /// Who created it.
    pub creator: UserId,

    /// Creator-claimed timestamp (Unix ms).
    pub created_at: i64,

    pub payload: EventPayload,
}

impl StreamEvent {
    /// Build an event and derive its id from the CBOR encoding of its body.
    pub fn new(creator: UserId, created_at: i64, payload: EventPayload) -> Result<Self, CoreError> {
        let event_id = Self::compute_id(&creator, created_at, &payload)?;
        Ok(Self {
            event_id,
            creator,
            created_at,
            payload,
        })
    }

    /// Recompute the content address of an event body.
    pub fn compute_id(
        creator: &UserId,
        created_at: i64,
        payload: &EventPayload,
    ) -> Result<EventId, CoreError> {
        let body = EventBody {
            creator,
            created_at,
            payload,
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&body, &mut buf)
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(EventId::hash(&buf))
    }

    /// Check the stored id against the body.
    pub fn verify_id(&self) -> Result<(), CoreError> {
        let actual = Self::compute_id(&self.creator, self.created_at, &self.payload)?;
        if actual != self.event_id {
            return Err(CoreError::EventIdMismatch {
                expected: self.event_id.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}

/// A committed miniblock: its number and the events it confirms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiniblockHeader {
    pub miniblock_num: u64,
    pub events: Vec<StreamEvent>,
}

/// A joined member as recorded in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMember {
    pub user_id: UserId,
    /// Miniblock the membership was committed in.
    pub miniblock_num: u64,
    pub display_name: Option<EncryptedData>,
    pub linked_address: Option<[u8; 20]>,
    pub nft: Option<NftBadge>,
}

impl SnapshotMember {
    pub fn new(user_id: UserId, miniblock_num: u64) -> Self {
        Self {
            user_id,
            miniblock_num,
            display_name: None,
            linked_address: None,
            nft: None,
        }
    }
}

/// Point-in-time compaction of a stream plus its unconfirmed tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub stream_id: StreamId,

    /// Latest confirmed miniblock covered by this snapshot.
    pub miniblock_num: u64,

    /// Joined members at that point.
    pub members: Vec<SnapshotMember>,

    /// Events accepted after the snapshot but not yet committed.
    pub minipool: Vec<StreamEvent>,

    /// Where a subscription should resume from.
    pub next_cookie: SyncCookie,
}

impl StreamSnapshot {
    /// An empty snapshot at miniblock 0.
    pub fn empty(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            miniblock_num: 0,
            members: Vec::new(),
            minipool: Vec::new(),
            next_cookie: SyncCookie::new(stream_id, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(n: u8) -> UserId {
        UserId::from_bytes([n; 20])
    }

    #[test]
    fn test_event_id_depends_on_body() {
        let join = EventPayload::Membership {
            user: user(1),
            op: MembershipOp::Join,
        };
        let a = StreamEvent::new(user(1), 1000, join.clone()).unwrap();
        let b = StreamEvent::new(user(1), 1000, join.clone()).unwrap();
        let c = StreamEvent::new(user(1), 1001, join).unwrap();
        assert_eq!(a.event_id, b.event_id);
        assert_ne!(a.event_id, c.event_id);
        a.verify_id().unwrap();
    }

    #[test]
    fn test_verify_id_detects_tampering() {
        let mut event =
            StreamEvent::new(user(2), 5, EventPayload::LinkedAddress([3; 20])).unwrap();
        event.created_at = 6;
        assert!(matches!(
            event.verify_id(),
            Err(CoreError::EventIdMismatch { .. })
        ));
    }

    #[test]
    fn test_membership_op_from_wire() {
        assert_eq!(MembershipOp::try_from(2).unwrap(), MembershipOp::Join);
        assert!(matches!(
            MembershipOp::try_from(9),
            Err(CoreError::UnknownMembershipOp(9))
        ));
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let snapshot = StreamSnapshot::empty(StreamId::space(&[1; 20]));
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: StreamSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
