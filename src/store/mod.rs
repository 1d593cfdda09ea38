//! Local persistence - the storage contract the core relies on.
//!
//! A [`LocalStore`] offers three primitives:
//! - typed reads of stored models, each with its local row version
//! - [`LocalCommit`]: an atomic batch of row writes, session counter
//!   adjustments, and sync queue appends
//! - [`LocalStore::with_queue`]: atomic read-modify-write of the queue table,
//!   shared by foreground enqueue/cancel and the background drain
//!
//! [`InMemoryStore`] is the reference implementation.

mod commit;
mod in_memory;
mod queue_table;

use thiserror::Error;

use crate::model::{Climb, Model, Session, Versioned};
use crate::sync::SyncQueueItem;

pub use commit::{LocalCommit, WriteOp};
pub use in_memory::InMemoryStore;
pub use queue_table::QueueTable;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store lock poisoned during {0}")]
    LockPoisoned(&'static str),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("not found: {collection}:{id}")]
    NotFound { collection: String, id: String },
    #[error("concurrent write on {collection}:{id} (expected version {expected}, found {actual})")]
    ConcurrentWrite {
        collection: String,
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("session {0} is closed")]
    SessionClosed(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serde(err.to_string())
    }
}

/// Durable local storage with per-row atomic read-modify-write.
pub trait LocalStore: Send + Sync {
    /// Get a model by ID. Returns None if not found.
    fn get<M: Model>(&self, id: &str) -> Result<Option<Versioned<M>>, StoreError>;

    /// Find models matching a predicate.
    fn find<M: Model>(&self, predicate: &dyn Fn(&M) -> bool)
        -> Result<Vec<Versioned<M>>, StoreError>;

    /// Apply every operation of `commit`, or none of them.
    ///
    /// Returns the appended queue items with their assigned sequence numbers.
    fn commit(&self, commit: LocalCommit) -> Result<Vec<SyncQueueItem>, StoreError>;

    /// Atomically rewrite a session given a consistent view of its climbs.
    ///
    /// Returns None if the session does not exist.
    fn update_session_with_climbs<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session, &[Climb]) -> T,
    ) -> Result<Option<T>, StoreError>;

    /// Run `f` with exclusive access to the sync queue table.
    fn with_queue<T>(&self, f: impl FnOnce(&mut QueueTable) -> T) -> Result<T, StoreError>;
}
