//! Identifiers for QUARRY entities.
//!
//! Session ids are user-visible and double as file stems in the runtime
//! directory, so they are validated on construction. Owner ids are random
//! UUIDs. Sequence ids number execution requests within one worker.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum session id length in bytes
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Session identifier - names one research session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Parse and validate a session id
    ///
    /// Accepts 1-64 characters from `[A-Za-z0-9._-]` that do not start with `.`.
    ///
    /// # Errors
    ///
    /// Returns error if the id is empty, too long, or contains other characters
    pub fn parse(raw: &str) -> CoreResult<Self> {
        if raw.is_empty() {
            return Err(CoreError::InvalidId {
                reason: "session id is empty".to_string(),
            });
        }
        if raw.len() > MAX_SESSION_ID_LEN {
            return Err(CoreError::InvalidId {
                reason: format!("session id exceeds {} bytes", MAX_SESSION_ID_LEN),
            });
        }
        if raw.starts_with('.') {
            return Err(CoreError::InvalidId {
                reason: "session id must not start with '.'".to_string(),
            });
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(CoreError::InvalidId {
                reason: format!("session id contains invalid character {:?}", bad),
            });
        }
        Ok(Self(raw.to_string()))
    }

    /// Get as string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl std::str::FromStr for SessionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner identifier - identifies the supervisor holding a session lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(Uuid);

impl OwnerId {
    /// Create a new random OwnerId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "owner_{}", self.0)
    }
}

/// Sequence identifier - numbers execution requests on one channel
///
/// Zero is reserved for frames that are not execution requests
/// (handshake and heartbeats use their own counter).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceId(u64);

impl SequenceId {
    /// The first sequence id handed out on a fresh channel
    pub const FIRST: SequenceId = SequenceId(1);

    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Next sequence id
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for SequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
