use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::item::{EntityType, Mutation, Operation};

/// The remote authority's view of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub version: u64,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
}

/// One delivery attempt as sent over the wire.
///
/// `mutation_id` is stable across redeliveries of the same queue item, so the
/// remote can recognize and ignore duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMutation {
    pub mutation_id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub mutation: Mutation,
    /// Last remote version the client saw. `None` for a first create; a
    /// create resent after a conflict carries the version it overwrites.
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteOutcome {
    Acknowledged { version: u64 },
    /// The entity changed remotely since `expected_version`. Some remotes
    /// report the mismatch without the current state.
    Conflict { current: Option<RemoteSnapshot> },
    /// Permanent refusal, e.g. a validation failure. Never retried.
    Rejected { reason: String },
}

/// Transient delivery failures. Every variant is retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("network error: {0}")]
    Network(String),
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote unavailable: {0}")]
    Unavailable(String),
}

/// Push side of the remote authority.
pub trait RemoteAuthority: Send + Sync {
    /// Apply a mutation idempotently.
    fn apply_mutation(&self, request: &RemoteMutation) -> Result<RemoteOutcome, DeliveryError>;

    /// Current remote state of an entity, if it exists.
    fn fetch_version(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<RemoteSnapshot>, DeliveryError>;
}

impl<R: RemoteAuthority + ?Sized> RemoteAuthority for Arc<R> {
    fn apply_mutation(&self, request: &RemoteMutation) -> Result<RemoteOutcome, DeliveryError> {
        (**self).apply_mutation(request)
    }

    fn fetch_version(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<RemoteSnapshot>, DeliveryError> {
        (**self).fetch_version(entity_type, entity_id)
    }
}

#[derive(Default)]
struct RemoteState {
    records: HashMap<(EntityType, String), RemoteSnapshot>,
    applied: HashMap<String, u64>,
    deliveries: Vec<RemoteMutation>,
    scripted_failures: VecDeque<DeliveryError>,
    offline: Option<String>,
    rejections: HashMap<String, String>,
    bare_conflicts: bool,
    latency: Option<Duration>,
}

/// In-process remote authority with version checks, duplicate detection,
/// and fault injection. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, RemoteState>, DeliveryError> {
        self.state
            .lock()
            .map_err(|_| DeliveryError::Unavailable("remote state poisoned".into()))
    }

    fn state_unchecked(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next delivery with `error`. Calls stack up in order.
    pub fn fail_next(&self, error: DeliveryError) {
        self.state_unchecked().scripted_failures.push_back(error);
    }

    /// Fail every delivery as unavailable until [`go_online`](Self::go_online).
    pub fn go_offline(&self, reason: impl Into<String>) {
        self.state_unchecked().offline = Some(reason.into());
    }

    pub fn go_online(&self) {
        self.state_unchecked().offline = None;
    }

    /// Reject every mutation of `entity_id`.
    pub fn reject_entity(&self, entity_id: impl Into<String>, reason: impl Into<String>) {
        self.state_unchecked()
            .rejections
            .insert(entity_id.into(), reason.into());
    }

    /// Report conflicts without a snapshot, forcing a `fetch_version`.
    pub fn report_bare_conflicts(&self, bare: bool) {
        self.state_unchecked().bare_conflicts = bare;
    }

    /// Delay every delivery, to exercise client timeouts.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state_unchecked().latency = latency;
    }

    /// Overwrite remote state directly, as another device would.
    pub fn put_snapshot(&self, snapshot: RemoteSnapshot) {
        let key = (snapshot.entity_type, snapshot.entity_id.clone());
        self.state_unchecked().records.insert(key, snapshot);
    }

    pub fn snapshot(&self, entity_type: EntityType, entity_id: &str) -> Option<RemoteSnapshot> {
        self.state_unchecked()
            .records
            .get(&(entity_type, entity_id.to_string()))
            .cloned()
    }

    /// Every request received, including failed and duplicate ones.
    pub fn deliveries(&self) -> Vec<RemoteMutation> {
        self.state_unchecked().deliveries.clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.state_unchecked().deliveries.len()
    }

    /// Number of distinct mutations applied.
    pub fn applied_count(&self) -> usize {
        self.state_unchecked().applied.len()
    }
}

impl RemoteAuthority for InMemoryRemote {
    fn apply_mutation(&self, request: &RemoteMutation) -> Result<RemoteOutcome, DeliveryError> {
        let latency = self.state()?.latency;
        if let Some(latency) = latency {
            thread::sleep(latency);
        }

        let mut state = self.state()?;
        state.deliveries.push(request.clone());

        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }
        if let Some(reason) = &state.offline {
            return Err(DeliveryError::Unavailable(reason.clone()));
        }
        if let Some(version) = state.applied.get(&request.mutation_id) {
            return Ok(RemoteOutcome::Acknowledged { version: *version });
        }

        let mutation = &request.mutation;
        if let Some(reason) = state.rejections.get(&mutation.entity_id) {
            return Ok(RemoteOutcome::Rejected {
                reason: reason.clone(),
            });
        }

        let key = (mutation.entity_type, mutation.entity_id.clone());
        let current = state.records.get(&key).cloned();
        let conflict = |existing: RemoteSnapshot, bare: bool| RemoteOutcome::Conflict {
            current: if bare { None } else { Some(existing) },
        };

        match (mutation.operation, current.as_ref()) {
            (Operation::Create, Some(existing))
                if !existing.deleted && request.expected_version != Some(existing.version) =>
            {
                return Ok(conflict(existing.clone(), state.bare_conflicts));
            }
            (Operation::Update | Operation::Delete, None) => {
                return Ok(RemoteOutcome::Rejected {
                    reason: format!("unknown {} {}", mutation.entity_type, mutation.entity_id),
                });
            }
            (Operation::Update | Operation::Delete, Some(existing))
                if existing.deleted || request.expected_version != Some(existing.version) =>
            {
                return Ok(conflict(existing.clone(), state.bare_conflicts));
            }
            _ => {}
        }

        let version = current.as_ref().map(|existing| existing.version + 1).unwrap_or(1);
        let payload = match (mutation.operation, current) {
            (Operation::Delete, Some(existing)) => existing.payload,
            _ => mutation.payload.clone(),
        };
        state.records.insert(
            key,
            RemoteSnapshot {
                entity_type: mutation.entity_type,
                entity_id: mutation.entity_id.clone(),
                version,
                payload,
                updated_at: mutation.recorded_at,
                deleted: mutation.operation == Operation::Delete,
            },
        );
        state.applied.insert(request.mutation_id.clone(), version);
        Ok(RemoteOutcome::Acknowledged { version })
    }

    fn fetch_version(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<RemoteSnapshot>, DeliveryError> {
        let state = self.state()?;
        if let Some(reason) = &state.offline {
            return Err(DeliveryError::Unavailable(reason.clone()));
        }
        Ok(state.records.get(&(entity_type, entity_id.to_string())).cloned())
    }
}
