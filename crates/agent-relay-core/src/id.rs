//! Session identifiers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix marking a locally-generated id with no server record yet.
const PROVISIONAL_PREFIX: &str = "local-";

/// Session identifier.
///
/// Two flavors: *provisional* (locally generated before the server has
/// assigned one) and *durable* (server-assigned). A session transitions
/// provisional -> durable at most once, via `SessionStore::rekey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a server-assigned (durable) id.
    #[must_use]
    pub fn durable<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Mint a fresh provisional id.
    #[must_use]
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{}", Uuid::new_v4()))
    }

    /// Whether this id was locally generated and has no server record.
    #[must_use]
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }

    /// The raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
