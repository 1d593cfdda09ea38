use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{Climb, Model, Session};

use super::remote::RemoteSnapshot;

/// Entity kinds that propagate to the remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Session,
    Climb,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::Session => f.write_str("session"),
            EntityType::Climb => f.write_str("climb"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Models that have a remote counterpart.
pub trait Syncable: Model {
    const ENTITY_TYPE: EntityType;
}

impl Syncable for Session {
    const ENTITY_TYPE: EntityType = EntityType::Session;
}

impl Syncable for Climb {
    const ENTITY_TYPE: EntityType = EntityType::Climb;
}

/// An already-applied local change that must reach the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    /// Local time of the change; the last-write-wins tiebreaker.
    pub recorded_at: DateTime<Utc>,
}

impl Mutation {
    pub fn create<M: Syncable>(model: &M, at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Self::snapshot(Operation::Create, model, at)
    }

    pub fn update<M: Syncable>(model: &M, at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Self::snapshot(Operation::Update, model, at)
    }

    pub fn delete<M: Syncable>(id: impl Into<String>, at: DateTime<Utc>) -> Self {
        let id = id.into();
        Self {
            entity_type: M::ENTITY_TYPE,
            payload: serde_json::json!({ "id": id }),
            entity_id: id,
            operation: Operation::Delete,
            recorded_at: at,
        }
    }

    fn snapshot<M: Syncable>(
        operation: Operation,
        model: &M,
        at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            entity_type: M::ENTITY_TYPE,
            entity_id: model.id().to_string(),
            operation,
            payload: serde_json::to_value(model)?,
            recorded_at: at,
        })
    }
}

/// Delivery ordering hints for an enqueued mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Higher priorities are delivered first.
    pub priority: i32,
    /// Items sharing a batch are delivered strictly in enqueue order.
    pub batch_id: Option<String>,
}

impl EnqueueOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
}

/// Delivery state of a queue item. Acknowledged items are deleted, so they
/// have no status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Pending,
    InFlight,
    Retrying,
    Failed,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InFlight => "in_flight",
            QueueStatus::Retrying => "retrying",
            QueueStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The remote refused the mutation as invalid.
    Rejected,
    /// The remote entity changed since our last known version and the
    /// conflict policy sided with the remote.
    Conflict,
    /// Retryable failures used up every attempt.
    AttemptsExhausted,
}

/// Why an item ended up Failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
    /// The remote state that won a conflict, kept for user review.
    pub remote_snapshot: Option<RemoteSnapshot>,
    pub failed_at: DateTime<Utc>,
}

impl Failure {
    pub fn rejected(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind: FailureKind::Rejected,
            reason: reason.into(),
            remote_snapshot: None,
            failed_at: at,
        }
    }

    pub fn conflict(snapshot: RemoteSnapshot, at: DateTime<Utc>) -> Self {
        Self {
            kind: FailureKind::Conflict,
            reason: format!(
                "remote {} {} is at version {}",
                snapshot.entity_type, snapshot.entity_id, snapshot.version
            ),
            remote_snapshot: Some(snapshot),
            failed_at: at,
        }
    }

    pub fn exhausted(last_error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind: FailureKind::AttemptsExhausted,
            reason: last_error.into(),
            remote_snapshot: None,
            failed_at: at,
        }
    }
}

/// Durable outbox entry for one local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: String,
    /// Enqueue order, assigned by the store on append.
    pub seq: u64,
    pub user_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry: DateTime<Utc>,
    /// Backoff interval chosen at the last reschedule.
    pub last_delay_ms: Option<u64>,
    pub last_error: Option<String>,
    pub priority: i32,
    pub batch_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Remote version to send instead of the locally tracked one, set when a
    /// conflict was resolved in favour of the local change.
    pub expected_version: Option<u64>,
    pub cancel_requested: bool,
    pub failure: Option<Failure>,
}

impl SyncQueueItem {
    pub fn new(
        user_id: impl Into<String>,
        mutation: Mutation,
        options: EnqueueOptions,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            seq: 0,
            user_id: user_id.into(),
            entity_type: mutation.entity_type,
            entity_id: mutation.entity_id,
            operation: mutation.operation,
            payload: mutation.payload,
            recorded_at: mutation.recorded_at,
            status: QueueStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            next_retry: now,
            last_delay_ms: None,
            last_error: None,
            priority: options.priority,
            batch_id: options.batch_id,
            created_at: now,
            expected_version: None,
            cancel_requested: false,
            failure: None,
        }
    }

    pub fn mutation(&self) -> Mutation {
        Mutation {
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
            operation: self.operation,
            payload: self.payload.clone(),
            recorded_at: self.recorded_at,
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.status, QueueStatus::Pending | QueueStatus::Retrying)
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == QueueStatus::InFlight
    }

    pub fn is_failed(&self) -> bool {
        self.status == QueueStatus::Failed
    }

    /// Whether `later` cannot be delivered once this item is dropped undelivered.
    ///
    /// Only a dropped create has dependents: later items for the same entity,
    /// and every later item of a batch named after that entity
    /// (`"session:{id}"` for a session create).
    pub fn is_required_by(&self, later: &SyncQueueItem) -> bool {
        if self.operation != Operation::Create
            || later.seq <= self.seq
            || later.batch_id.is_none()
            || later.batch_id != self.batch_id
        {
            return false;
        }
        let anchor = format!("{}:{}", self.entity_type, self.entity_id);
        self.batch_id.as_deref() == Some(anchor.as_str())
            || (later.entity_type == self.entity_type && later.entity_id == self.entity_id)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_waiting() && self.next_retry <= now
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Pending/Retrying -> InFlight. Counts the attempt.
    pub fn claim(&mut self) -> bool {
        if !self.is_waiting() {
            return false;
        }
        self.status = QueueStatus::InFlight;
        self.attempts += 1;
        true
    }

    /// InFlight -> Retrying after a retryable failure.
    pub fn reschedule(&mut self, error: impl Into<String>, delay: Duration, now: DateTime<Utc>) -> bool {
        if !self.is_in_flight() {
            return false;
        }
        let delay_ms = delay.as_millis() as u64;
        self.status = QueueStatus::Retrying;
        self.last_error = Some(error.into());
        self.last_delay_ms = Some(delay_ms);
        self.next_retry = now + chrono::Duration::milliseconds(delay_ms as i64);
        true
    }

    /// InFlight -> Pending against a newer remote version, due immediately.
    pub fn rebase(&mut self, remote_version: u64, now: DateTime<Utc>) -> bool {
        if !self.is_in_flight() {
            return false;
        }
        self.status = QueueStatus::Pending;
        self.expected_version = Some(remote_version);
        self.last_error = Some(format!("conflict resolved locally over remote version {remote_version}"));
        self.next_retry = now;
        true
    }

    /// Any non-terminal state -> Failed.
    pub fn fail(&mut self, failure: Failure) -> bool {
        if self.is_failed() {
            return false;
        }
        self.status = QueueStatus::Failed;
        self.last_error = Some(failure.reason.clone());
        self.failure = Some(failure);
        true
    }

    /// Failed -> Pending with a fresh attempt budget.
    ///
    /// Re-arming a conflict keeps the local change: it is resent against the
    /// remote version recorded in the conflict snapshot.
    pub fn rearm(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_failed() {
            return false;
        }
        if let Some(snapshot) = self
            .failure
            .as_ref()
            .and_then(|failure| failure.remote_snapshot.as_ref())
        {
            self.expected_version = Some(snapshot.version);
        }
        self.status = QueueStatus::Pending;
        self.attempts = 0;
        self.next_retry = now;
        self.last_delay_ms = None;
        self.failure = None;
        true
    }

    /// InFlight -> Pending for an attempt interrupted by a crash.
    pub fn recover(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_in_flight() {
            return false;
        }
        self.status = QueueStatus::Pending;
        self.next_retry = now;
        true
    }
}
