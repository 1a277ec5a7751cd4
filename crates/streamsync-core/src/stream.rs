//! Stream identity and resumption cookies.
//!
//! A stream id is 32 bytes. The first byte is a prefix that classifies the
//! stream, the remaining bytes carry the identity it was derived from
//! (an account address, a space address, a random discriminator).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;
use crate::types::UserId;

/// Length of a stream id in bytes.
pub const STREAM_ID_LEN: usize = 32;

/// Classification of a stream, read from the id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Channel,
    Dm,
    Gdm,
    Media,
    Space,
    User,
    UserDevice,
    UserInbox,
    UserSettings,
    Unknown(u8),
}

impl StreamKind {
    /// The id prefix byte for this kind.
    pub const fn prefix(self) -> u8 {
        match self {
            StreamKind::Channel => 0x20,
            StreamKind::Dm => 0x88,
            StreamKind::Gdm => 0x77,
            StreamKind::Media => 0xff,
            StreamKind::Space => 0x10,
            StreamKind::User => 0xa8,
            StreamKind::UserDevice => 0xad,
            StreamKind::UserInbox => 0xa1,
            StreamKind::UserSettings => 0xa5,
            StreamKind::Unknown(p) => p,
        }
    }

    /// Decode a prefix byte.
    pub const fn from_prefix(prefix: u8) -> Self {
        match prefix {
            0x20 => StreamKind::Channel,
            0x88 => StreamKind::Dm,
            0x77 => StreamKind::Gdm,
            0xff => StreamKind::Media,
            0x10 => StreamKind::Space,
            0xa8 => StreamKind::User,
            0xad => StreamKind::UserDevice,
            0xa1 => StreamKind::UserInbox,
            0xa5 => StreamKind::UserSettings,
            other => StreamKind::Unknown(other),
        }
    }

    /// Streams owned by a single account: the user's own profile, devices,
    /// inbox and settings.
    pub const fn is_user_scoped(self) -> bool {
        matches!(
            self,
            StreamKind::User
                | StreamKind::UserDevice
                | StreamKind::UserInbox
                | StreamKind::UserSettings
        )
    }

    /// Direct or group message channels.
    pub const fn is_dm(self) -> bool {
        matches!(self, StreamKind::Dm | StreamKind::Gdm)
    }
}

/// A 32-byte stream identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub [u8; STREAM_ID_LEN]);

impl StreamId {
    /// Build an id from a kind and identity bytes, zero padded.
    ///
    /// Identities longer than 31 bytes are rejected.
    pub fn new(kind: StreamKind, identity: &[u8]) -> Result<Self, CoreError> {
        if identity.len() >= STREAM_ID_LEN {
            return Err(CoreError::InvalidStreamId(format!(
                "identity of {} bytes does not fit",
                identity.len()
            )));
        }
        let mut bytes = [0u8; STREAM_ID_LEN];
        bytes[0] = kind.prefix();
        bytes[1..=identity.len()].copy_from_slice(identity);
        Ok(Self(bytes))
    }

    /// One of the account-scoped streams for `user`.
    pub fn for_user(kind: StreamKind, user: &UserId) -> Self {
        let mut bytes = [0u8; STREAM_ID_LEN];
        bytes[0] = kind.prefix();
        bytes[1..21].copy_from_slice(user.as_bytes());
        Self(bytes)
    }

    /// The stream of a space, keyed by its 20-byte contract address.
    pub fn space(address: &[u8; 20]) -> Self {
        let mut bytes = [0u8; STREAM_ID_LEN];
        bytes[0] = StreamKind::Space.prefix();
        bytes[1..21].copy_from_slice(address);
        Self(bytes)
    }

    /// A channel inside `space`. Bytes 1..21 repeat the space address, the
    /// tail is a discriminator.
    pub fn channel(space: &StreamId, discriminator: &[u8]) -> Result<Self, CoreError> {
        if space.kind() != StreamKind::Space {
            return Err(CoreError::InvalidStreamId(format!("{} is not a space", space)));
        }
        if discriminator.len() > STREAM_ID_LEN - 21 {
            return Err(CoreError::InvalidStreamId("channel discriminator too long".into()));
        }
        let mut bytes = space.0;
        bytes[0] = StreamKind::Channel.prefix();
        bytes[21..21 + discriminator.len()].copy_from_slice(discriminator);
        Ok(Self(bytes))
    }

    /// The space a channel belongs to.
    pub fn space_id_from_channel(&self) -> Result<Self, CoreError> {
        if self.kind() != StreamKind::Channel {
            return Err(CoreError::InvalidStreamId(format!("{} is not a channel", self)));
        }
        let mut bytes = [0u8; STREAM_ID_LEN];
        bytes[0] = StreamKind::Space.prefix();
        bytes[1..21].copy_from_slice(&self.0[1..21]);
        Ok(Self(bytes))
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; STREAM_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; STREAM_ID_LEN] {
        &self.0
    }

    /// The kind encoded in the prefix.
    pub const fn kind(&self) -> StreamKind {
        StreamKind::from_prefix(self.0[0])
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let mut arr = [0u8; STREAM_ID_LEN];
        hex::decode_to_slice(s, &mut arr)
            .map_err(|e| CoreError::InvalidStreamId(format!("{}: {}", s, e)))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for StreamId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; STREAM_ID_LEN]> for StreamId {
    fn from(bytes: [u8; STREAM_ID_LEN]) -> Self {
        Self(bytes)
    }
}

/// Resumption token for one stream: the last position this client has seen.
///
/// The server treats the cookie as opaque apart from the stream id; the
/// client only ever stores the latest one it received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCookie {
    /// The stream this cookie belongs to.
    pub stream_id: StreamId,

    /// Miniblock the position is anchored at.
    pub miniblock_num: u64,

    /// Offset into the minipool after that miniblock.
    pub minipool_gen: u64,

    /// Opaque server data (node address, session, ...).
    pub opaque: Bytes,
}

impl SyncCookie {
    /// A cookie positioned at the start of `miniblock_num`.
    pub fn new(stream_id: StreamId, miniblock_num: u64) -> Self {
        Self {
            stream_id,
            miniblock_num,
            minipool_gen: 0,
            opaque: Bytes::new(),
        }
    }

    /// Builder-style setter for the minipool offset.
    pub fn with_minipool_gen(mut self, gen: u64) -> Self {
        self.minipool_gen = gen;
        self
    }
}
