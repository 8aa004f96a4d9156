//! In-memory message and key storage.
//!
//! Provides a single-owner store with:
//! - Per-user ordered message lists (append-only, 1-indexed)
//! - Per-user key blobs (last write wins)
//! - Full reset of all state
//!
//! The store is owned by the event loop thread, so no locking is needed.

use bytes::Bytes;
use std::collections::HashMap;
use tracing::{info, trace};

/// A single stored message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Subject line shown by `list`
    pub subject: String,
    /// Raw message body
    pub body: Bytes,
}

/// In-memory message relay storage
#[derive(Debug, Default)]
pub struct Store {
    /// Messages per user, in insertion order
    messages: HashMap<String, Vec<Message>>,
    /// Latest key per user
    keys: HashMap<String, Bytes>,
}

impl Store {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message for a user.
    ///
    /// Returns the 1-based index assigned to the new message.
    pub fn append(&mut self, user: &str, subject: &str, body: Bytes) -> usize {
        let messages = self.messages.entry(user.to_string()).or_default();
        messages.push(Message {
            subject: subject.to_string(),
            body,
        });

        trace!(user, subject, index = messages.len(), "Stored message");
        messages.len()
    }

    /// List `(index, subject)` pairs for a user in insertion order.
    ///
    /// An unknown user has no messages.
    pub fn list(&self, user: &str) -> Vec<(usize, &str)> {
        self.messages
            .get(user)
            .map(|messages| {
                messages
                    .iter()
                    .enumerate()
                    .map(|(i, m)| (i + 1, m.subject.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get a message by its 1-based index.
    ///
    /// Returns `None` for unknown users and for indices outside `1..=count`.
    pub fn get(&self, user: &str, index: i64) -> Option<&Message> {
        if index <= 0 {
            return None;
        }
        let position = usize::try_from(index - 1).ok()?;
        self.messages.get(user)?.get(position)
    }

    /// Store or overwrite the key for a user
    pub fn set_key(&mut self, user: &str, key: Bytes) {
        trace!(user, len = key.len(), "Stored key");
        self.keys.insert(user.to_string(), key);
    }

    /// Get the key for a user
    pub fn get_key(&self, user: &str) -> Option<&Bytes> {
        self.keys.get(user)
    }

    /// Remove every message and key
    pub fn reset(&mut self) {
        let stats = self.stats();
        self.messages.clear();
        self.keys.clear();

        info!(
            users = stats.users,
            messages = stats.messages,
            keys = stats.keys,
            body_bytes = stats.body_bytes,
            "Store reset"
        );
    }

    /// Get statistics about the store
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            users: self.messages.len(),
            messages: self.messages.values().map(Vec::len).sum(),
            keys: self.keys.len(),
            body_bytes: self
                .messages
                .values()
                .flatten()
                .map(|m| m.body.len())
                .sum(),
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Users with at least one message
    pub users: usize,
    /// Total stored messages
    pub messages: usize,
    /// Users with a stored key
    pub keys: usize,
    /// Total size of all message bodies
    pub body_bytes: usize,
}
