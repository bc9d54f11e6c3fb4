//! Transcript messages and id minting.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A code location attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeReference {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// One transcript message.
///
/// Ids are minted from a store-local monotonic counter (`msg-<n>`) so
/// collisions between locally pending messages and server-returned history
/// can be detected and repaired by [`dedupe_ids`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, rename = "codeReferences", skip_serializing_if = "Vec::is_empty")]
    pub code_references: Vec<CodeReference>,
}

impl Message {
    /// Create a message with the given id.
    #[must_use]
    pub fn new<S: Into<String>>(id: String, role: Role, content: S) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            code_references: Vec::new(),
        }
    }
}

/// Monotonic `msg-<n>` id counter.
///
/// One per [`crate::SessionStore`], shared across sessions so that
/// pre-session pending messages merge into a newly assigned session
/// without colliding.
#[derive(Debug, Default)]
pub struct IdMinter {
    next: AtomicU64,
}

impl IdMinter {
    /// Create a minter starting at `msg-1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Mint the next message id.
    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("msg-{n}")
    }
}

/// Reassign fresh ids to any message whose id was already seen.
///
/// Relative order and content are preserved; only colliding ids change.
/// Used whenever server-returned history is merged with other message
/// lists (resume, pending-message merge).
#[must_use]
pub fn dedupe_ids(minter: &IdMinter, messages: Vec<Message>) -> Vec<Message> {
    let mut seen: HashSet<String> = HashSet::with_capacity(messages.len());
    messages
        .into_iter()
        .map(|mut msg| {
            if !seen.insert(msg.id.clone()) {
                msg.id = minter.next_id();
                seen.insert(msg.id.clone());
            }
            msg
        })
        .collect()
}
