//! Message persistence contract.
//!
//! Trait-based abstraction for message history. The trait is synchronous
//! (no async) so sans-IO engines can call it directly; async drivers wrap
//! calls as needed. No concrete engine ships with the core — only an
//! in-memory reference implementation for tests and ephemeral sessions.
//!
//! Implementations must be `Clone`: clones share the same underlying
//! store (typically via `Arc`), so multiple engines can persist through
//! one backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delivery status of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Accepted locally, not yet sent.
    Pending,
    /// Handed to the transport.
    Sent,
    /// Peer confirmed delivery.
    Delivered,
    /// Peer confirmed display.
    Read,
    /// Send failed permanently.
    Failed,
}

/// One persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Store-assigned id, unique within the store.
    pub local_id: u64,
    /// Conversation scope: a peer's stable tag or a group id.
    pub scope_id: String,
    /// Authoring device or peer id.
    pub author_id: String,
    /// Message text.
    pub content: String,
    /// When the message was created locally.
    pub timestamp: DateTime<Utc>,
    /// Delivery status.
    pub status: MessageStatus,
}

/// Storage failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No message with the given local id exists.
    #[error("no stored message with id {local_id}")]
    NotFound {
        /// The id that was looked up.
        local_id: u64,
    },

    /// Backend failure, e.g. an I/O error in a persistent engine.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Message history persistence.
///
/// Scope ids partition history by conversation. `get_messages` returns
/// newest-last within a scope, paginated by `limit`/`offset` from the
/// newest end.
pub trait MessageStore: Clone + Send + Sync + 'static {
    /// Load up to `limit` messages for a scope, skipping `offset` from
    /// the newest.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the backend fails. An
    /// unknown scope is an empty result, not an error.
    fn get_messages(
        &self,
        scope_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>, StorageError>;

    /// Persist a message, assigning its `local_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the backend fails.
    fn save_message(&self, message: StoredMessage) -> Result<u64, StorageError>;

    /// Update the delivery status of a stored message.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for an unknown id.
    fn update_status(&self, local_id: u64, status: MessageStatus) -> Result<(), StorageError>;

    /// Delete all messages in a scope. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the backend fails.
    fn delete_messages(&self, scope_id: &str) -> Result<usize, StorageError>;
}

#[derive(Default)]
struct MemoryInner {
    next_id: u64,
    /// Per-scope logs, oldest first.
    scopes: HashMap<String, Vec<StoredMessage>>,
}

/// In-memory reference store.
///
/// Clones share one underlying map. Not durable; for tests and
/// history-free ephemeral sessions.
#[derive(Clone, Default)]
pub struct MemoryMessageStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryMessageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut MemoryInner) -> T) -> T {
        // A poisoned lock only means another test thread panicked; the
        // data itself is still coherent for this store's operations.
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl MessageStore for MemoryMessageStore {
    fn get_messages(
        &self,
        scope_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        Ok(self.with_inner(|inner| {
            let Some(log) = inner.scopes.get(scope_id) else {
                return Vec::new();
            };
            let end = log.len().saturating_sub(offset);
            let start = end.saturating_sub(limit);
            log[start..end].to_vec()
        }))
    }

    fn save_message(&self, mut message: StoredMessage) -> Result<u64, StorageError> {
        Ok(self.with_inner(|inner| {
            inner.next_id += 1;
            message.local_id = inner.next_id;
            let id = message.local_id;
            inner.scopes.entry(message.scope_id.clone()).or_default().push(message);
            id
        }))
    }

    fn update_status(&self, local_id: u64, status: MessageStatus) -> Result<(), StorageError> {
        self.with_inner(|inner| {
            for log in inner.scopes.values_mut() {
                if let Some(message) = log.iter_mut().find(|m| m.local_id == local_id) {
                    message.status = status;
                    return Ok(());
                }
            }
            Err(StorageError::NotFound { local_id })
        })
    }

    fn delete_messages(&self, scope_id: &str) -> Result<usize, StorageError> {
        Ok(self.with_inner(|inner| inner.scopes.remove(scope_id).map_or(0, |log| log.len())))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn message(scope: &str, content: &str) -> StoredMessage {
        StoredMessage {
            local_id: 0,
            scope_id: scope.to_owned(),
            author_id: "dev-a".to_owned(),
            content: content.to_owned(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().unwrap(),
            status: MessageStatus::Pending,
        }
    }

    #[test]
    fn save_assigns_increasing_ids() {
        let store = MemoryMessageStore::new();
        let first = store.save_message(message("peer-1", "a")).unwrap();
        let second = store.save_message(message("peer-1", "b")).unwrap();
        assert!(second > first);
    }

    #[test]
    fn pagination_returns_newest_window() {
        let store = MemoryMessageStore::new();
        for i in 0..10 {
            store.save_message(message("peer-1", &format!("m{i}"))).unwrap();
        }

        let newest = store.get_messages("peer-1", 3, 0).unwrap();
        assert_eq!(newest.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), vec![
            "m7", "m8", "m9"
        ]);

        let older = store.get_messages("peer-1", 3, 3).unwrap();
        assert_eq!(older.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), vec![
            "m4", "m5", "m6"
        ]);
    }

    #[test]
    fn unknown_scope_is_empty_not_an_error() {
        let store = MemoryMessageStore::new();
        assert!(store.get_messages("nobody", 10, 0).unwrap().is_empty());
    }

    #[test]
    fn scopes_are_isolated() {
        let store = MemoryMessageStore::new();
        store.save_message(message("peer-1", "to peer")).unwrap();
        store.save_message(message("group-1", "to group")).unwrap();

        assert_eq!(store.get_messages("peer-1", 10, 0).unwrap().len(), 1);
        assert_eq!(store.get_messages("group-1", 10, 0).unwrap().len(), 1);
    }

    #[test]
    fn status_updates_are_visible_to_clones() {
        let store = MemoryMessageStore::new();
        let clone = store.clone();

        let id = store.save_message(message("peer-1", "hi")).unwrap();
        clone.update_status(id, MessageStatus::Delivered).unwrap();

        let messages = store.get_messages("peer-1", 10, 0).unwrap();
        assert_eq!(messages[0].status, MessageStatus::Delivered);
    }

    #[test]
    fn update_unknown_id_fails() {
        let store = MemoryMessageStore::new();
        assert_eq!(
            store.update_status(99, MessageStatus::Read),
            Err(StorageError::NotFound { local_id: 99 })
        );
    }

    #[test]
    fn delete_clears_one_scope() {
        let store = MemoryMessageStore::new();
        store.save_message(message("peer-1", "a")).unwrap();
        store.save_message(message("peer-1", "b")).unwrap();
        store.save_message(message("peer-2", "c")).unwrap();

        assert_eq!(store.delete_messages("peer-1").unwrap(), 2);
        assert!(store.get_messages("peer-1", 10, 0).unwrap().is_empty());
        assert_eq!(store.get_messages("peer-2", 10, 0).unwrap().len(), 1);
    }
}
