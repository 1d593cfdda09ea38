//! LocalCommit - chain row writes, counter adjustments, and queue appends
//! into one atomic store operation.
//!
//! ## Example
//!
//! ```ignore
//! LocalCommit::new()
//!     .insert(&climb)?
//!     .adjust_counters(&climb.session_id, CounterDelta::for_insert(&climb))
//!     .enqueue(item)
//!     .commit(&store)?;
//! ```

use crate::counters::CounterDelta;
use crate::model::Model;
use crate::sync::SyncQueueItem;

use super::{LocalStore, StoreError};

/// One operation inside a [`LocalCommit`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Write serialized model bytes. `expected_version` of `Some(0)` means
    /// the row must not exist yet; `None` skips the check.
    Put {
        collection: &'static str,
        id: String,
        bytes: Vec<u8>,
        expected_version: Option<u64>,
    },
    Delete {
        collection: &'static str,
        id: String,
        expected_version: Option<u64>,
    },
    /// Read-modify-write of an open session's cached counters.
    AdjustCounters {
        session_id: String,
        delta: CounterDelta,
    },
    Enqueue(SyncQueueItem),
}

/// Builder for an atomic batch of local writes.
#[derive(Debug, Clone, Default)]
pub struct LocalCommit {
    ops: Vec<WriteOp>,
}

impl LocalCommit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a model without a version check.
    pub fn put<M: Model>(self, model: &M) -> Result<Self, StoreError> {
        self.write(model, None)
    }

    /// Insert a model that must not exist yet.
    pub fn insert<M: Model>(self, model: &M) -> Result<Self, StoreError> {
        self.write(model, Some(0))
    }

    /// Overwrite a model only if its row is still at `expected_version`.
    pub fn replace<M: Model>(self, model: &M, expected_version: u64) -> Result<Self, StoreError> {
        self.write(model, Some(expected_version))
    }

    pub fn delete<M: Model>(mut self, id: impl Into<String>, expected_version: Option<u64>) -> Self {
        self.ops.push(WriteOp::Delete {
            collection: M::COLLECTION,
            id: id.into(),
            expected_version,
        });
        self
    }

    /// Adjust a session's counters. Zero deltas are dropped.
    pub fn adjust_counters(mut self, session_id: impl Into<String>, delta: CounterDelta) -> Self {
        if !delta.is_zero() {
            self.ops.push(WriteOp::AdjustCounters {
                session_id: session_id.into(),
                delta,
            });
        }
        self
    }

    pub fn enqueue(mut self, item: SyncQueueItem) -> Self {
        self.ops.push(WriteOp::Enqueue(item));
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn commit<S: LocalStore + ?Sized>(self, store: &S) -> Result<Vec<SyncQueueItem>, StoreError> {
        store.commit(self)
    }

    fn write<M: Model>(mut self, model: &M, expected_version: Option<u64>) -> Result<Self, StoreError> {
        self.ops.push(WriteOp::Put {
            collection: M::COLLECTION,
            id: model.id().to_string(),
            bytes: serde_json::to_vec(model)?,
            expected_version,
        });
        Ok(self)
    }
}
