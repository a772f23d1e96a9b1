//! Stable identifier newtypes.
//!
//! Requests use a short 12-hex identifier (cheap to read back over a phone,
//! plenty of entropy for a single gateway process); discussions use a full
//! UUID since sessions are longer-lived and may be referenced externally.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A 12-hex-character request identifier, derived from a UUIDv4's simple
/// representation. Collisions are handled at the store layer via
/// `create_request`'s `Duplicate` error rather than avoided here.
///
/// `Serialize`/`Deserialize` are hand-written rather than derived: serde
/// renders a fixed-size `[u8; 12]` as a JSON array of integers, not the
/// hex string every other encoder/decoder of this id (`Display`,
/// `FromStr`, route params) expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub [u8; 12]);

impl Serialize for RequestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<RequestId>().map_err(serde::de::Error::custom)
    }
}

impl RequestId {
    pub fn new() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        let mut buf = [0u8; 12];
        buf.copy_from_slice(&simple.as_bytes()[..12]);
        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).expect("RequestId bytes are always ascii hex")
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestId {
    type Err = InvalidRequestId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 12 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidRequestId);
        }
        let mut buf = [0u8; 12];
        buf.copy_from_slice(s.as_bytes());
        Ok(Self(buf))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid request id: expected 12 hex characters")]
pub struct InvalidRequestId;

/// A discussion session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for SessionId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}

/// A discussion message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for MessageId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}
