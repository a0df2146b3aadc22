//! External persistence collaborator.
//!
//! The core only requires two things to survive a process restart: the
//! outbox queue and the last-seen cursor. Both are persisted through this
//! trait; the actual engine (SQLite, keychain, files) is supplied by the
//! embedding application.

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Storage error type.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying storage backend failed.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Stored data could not be decoded.
    #[error("corrupt stored value for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;

/// Trait for the persistence backend supplied by the host application.
///
/// Implementations must be cheap and synchronous; callers invoke these on
/// their owner task and never across an await point.
pub trait StateStore: Send + Sync {
    /// Loads the last persisted notification cursor, if any.
    fn load_cursor(&self) -> StoreResult<Option<i64>>;

    /// Persists the notification cursor.
    fn save_cursor(&self, cursor: i64) -> StoreResult<()>;

    /// Persists a serialized outbox entry keyed by its local id.
    fn put_outbox_entry(&self, local_id: &str, entry_json: &str) -> StoreResult<()>;

    /// Removes a persisted outbox entry. Removing a missing key is not an error.
    fn delete_outbox_entry(&self, local_id: &str) -> StoreResult<()>;

    /// Loads all persisted outbox entries as (local_id, json) pairs.
    fn load_outbox_entries(&self) -> StoreResult<Vec<(String, String)>>;
}

/// In-memory store used in tests and as a default for ephemeral clients.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    cursor: Mutex<Option<i64>>,
    outbox: Mutex<HashMap<String, String>>,
}

impl MemoryStateStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load_cursor(&self) -> StoreResult<Option<i64>> {
        Ok(*self.cursor.lock().expect("lock poisoned"))
    }

    fn save_cursor(&self, cursor: i64) -> StoreResult<()> {
        *self.cursor.lock().expect("lock poisoned") = Some(cursor);
        Ok(())
    }

    fn put_outbox_entry(&self, local_id: &str, entry_json: &str) -> StoreResult<()> {
        self.outbox
            .lock()
            .expect("lock poisoned")
            .insert(local_id.to_string(), entry_json.to_string());
        Ok(())
    }

    fn delete_outbox_entry(&self, local_id: &str) -> StoreResult<()> {
        self.outbox.lock().expect("lock poisoned").remove(local_id);
        Ok(())
    }

    fn load_outbox_entries(&self) -> StoreResult<Vec<(String, String)>> {
        Ok(self
            .outbox
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
