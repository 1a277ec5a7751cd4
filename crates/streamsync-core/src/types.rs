//! Strong type definitions for streamsync.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte event identifier, computed as Blake3(cbor(event body)).
///
/// Two events with the same creator and payload share an EventId, which is
/// what makes re-delivery of an event idempotent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub [u8; 32]);

impl EventId {
    /// Create a new EventId from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash arbitrary bytes into an EventId.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut arr = [0u8; 32];
        hex::decode_to_slice(s, &mut arr)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl From<[u8; 32]> for EventId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// A user identifier: a 20-byte account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub [u8; 20]);

impl UserId {
    /// Create from raw address bytes.
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Get the raw address bytes.
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parse from hex, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut arr = [0u8; 20];
        hex::decode_to_slice(s, &mut arr)?;
        Ok(Self(arr))
    }

    /// `0x`-prefixed lowercase hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.to_hex())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 20]> for UserId {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for UserId {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 20] = slice.try_into()?;
        Ok(Self(arr))
    }
}

/// Server-issued identifier of one live subscription.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncId(pub String);

impl SyncId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncId({})", self.0)
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_hex_roundtrip() {
        let id = EventId::from_bytes([0x42; 32]);
        let recovered = EventId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, recovered);
    }

    #[test]
    fn test_event_id_display() {
        let id = EventId::from_bytes([0xab; 32]);
        assert_eq!(format!("{}", id), "abababababababab");
        assert!(format!("{:?}", id).starts_with("EventId("));
    }

    #[test]
    fn test_event_id_hash_is_deterministic() {
        assert_eq!(EventId::hash(b"join"), EventId::hash(b"join"));
        assert_ne!(EventId::hash(b"join"), EventId::hash(b"leave"));
    }

    #[test]
    fn test_user_id_accepts_prefixed_hex() {
        let user = UserId::from_bytes([0x0f; 20]);
        let display = user.to_string();
        assert!(display.starts_with("0x"));
        assert_eq!(UserId::from_hex(&display).unwrap(), user);
        assert_eq!(UserId::from_hex(&display[2..]).unwrap(), user);
    }

    #[test]
    fn test_user_id_rejects_wrong_length() {
        assert!(UserId::from_hex("0x1234").is_err());
    }
}
