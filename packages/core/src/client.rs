//! Client identity, bookkeeping and selectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier a remote worker presents when polling for jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What the server knows about a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Successful results reported.
    pub processed: u64,
    /// Failed results reported.
    pub failed: u64,
    /// Jobs handed out without a result yet.
    pub in_progress: u64,
}

impl ClientInfo {
    pub fn new(id: ClientId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            first_seen: now,
            last_seen: now,
            processed: 0,
            failed: 0,
            in_progress: 0,
        }
    }
}

/// Allow/deny pattern: an exact client id, or a prefix ending in `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSelector<'a> {
    pattern: &'a str,
}

impl<'a> ClientSelector<'a> {
    pub fn new(pattern: &'a str) -> Self {
        Self {
            pattern: pattern.trim(),
        }
    }

    pub fn matches(&self, client: &ClientId) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => client.as_str().starts_with(prefix),
            None => client.as_str() == self.pattern,
        }
    }
}
