use std::sync::Arc;
#[cfg(feature = "emitter")]
use std::sync::Mutex;
use std::time::Duration;

#[cfg(feature = "emitter")]
use event_emitter_rs::EventEmitter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::model::Model;
use crate::store::{LocalCommit, LocalStore, QueueTable, StoreError};

use super::item::{
    EnqueueOptions, EntityType, Failure, FailureKind, Mutation, Operation, QueueStatus,
    SyncQueueItem,
};

/// Event name emitted whenever an item enters Failed.
#[cfg(feature = "emitter")]
pub const ITEM_FAILED_EVENT: &str = "sync:item_failed";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("queue item {0} not found")]
    ItemNotFound(String),
    #[error("queue item {id} is {status} and cannot be cancelled")]
    NotCancellable { id: String, status: QueueStatus },
    #[error("queue item {id} is {status}, not failed")]
    NotFailed { id: String, status: QueueStatus },
    #[error("failure listener registry poisoned")]
    ListenersPoisoned,
}

/// Last remote version acknowledged for an entity, tracked locally so
/// updates and deletes can carry an expected version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVersion {
    pub id: String,
    pub version: u64,
}

impl RemoteVersion {
    pub fn key(entity_type: EntityType, entity_id: &str) -> String {
        format!("{}:{}", entity_type, entity_id)
    }
}

impl Model for RemoteVersion {
    const COLLECTION: &'static str = "remote_versions";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The item was waiting and has been removed, along with the later
    /// batch items that could not be delivered without it.
    Cancelled {
        item: SyncQueueItem,
        dependents: Vec<SyncQueueItem>,
    },
    /// The item is being delivered; it is removed once the attempt settles
    /// unless the remote acknowledges it first.
    Deferred,
}

/// How a finished delivery attempt left the item.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    Acknowledged,
    Rescheduled(SyncQueueItem),
    Rebased(SyncQueueItem),
    Failed(SyncQueueItem),
    Cancelled(SyncQueueItem),
}

/// Item counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub retrying: usize,
    pub failed: usize,
}

impl QueueStats {
    /// Items the user needs to act on.
    pub fn needs_attention(&self) -> usize {
        self.failed
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.retrying + self.failed
    }
}

/// Payload of the item-failed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItemNotice {
    pub item_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: FailureKind,
    pub reason: String,
    pub attempts: u32,
}

impl FailedItemNotice {
    fn of(item: &SyncQueueItem) -> Option<Self> {
        let failure = item.failure.as_ref()?;
        Some(Self {
            item_id: item.id.clone(),
            entity_type: item.entity_type,
            entity_id: item.entity_id.clone(),
            kind: failure.kind,
            reason: failure.reason.clone(),
            attempts: item.attempts,
        })
    }
}

/// The durable outbox of local mutations.
///
/// Foreground callers enqueue, cancel, re-arm and purge; the background
/// [`SyncWorker`](super::SyncWorker) is the only caller of the delivery
/// transitions. Both sides go through [`LocalStore::with_queue`].
pub struct SyncQueue<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    #[cfg(feature = "emitter")]
    emitter: Arc<Mutex<EventEmitter>>,
}

impl<S> Clone for SyncQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            #[cfg(feature = "emitter")]
            emitter: Arc::clone(&self.emitter),
        }
    }
}

impl<S> SyncQueue<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: SyncConfig) -> Self {
        Self {
            store,
            clock,
            config,
            #[cfg(feature = "emitter")]
            emitter: Arc::new(Mutex::new(EventEmitter::new())),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Build an item for `mutation` without persisting it, for callers that
    /// append it inside their own [`LocalCommit`].
    pub fn new_item(
        &self,
        user_id: impl Into<String>,
        mutation: Mutation,
        options: EnqueueOptions,
    ) -> SyncQueueItem {
        SyncQueueItem::new(
            user_id,
            mutation,
            options,
            self.config.max_attempts,
            self.clock.now(),
        )
    }

    /// Register a listener for items entering Failed.
    #[cfg(feature = "emitter")]
    pub fn on_item_failed<F>(&self, listener: F) -> Result<String, QueueError>
    where
        F: Fn(FailedItemNotice) + Send + Sync + 'static,
    {
        let mut emitter = self
            .emitter
            .lock()
            .map_err(|_| QueueError::ListenersPoisoned)?;
        Ok(emitter.on(ITEM_FAILED_EVENT, listener))
    }

    fn notify_failed(&self, item: &SyncQueueItem) {
        let Some(notice) = FailedItemNotice::of(item) else {
            return;
        };
        error!(
            item_id = %notice.item_id,
            entity_type = %notice.entity_type,
            entity_id = %notice.entity_id,
            kind = ?notice.kind,
            attempts = notice.attempts,
            reason = %notice.reason,
            "sync item failed"
        );
        #[cfg(feature = "emitter")]
        match self.emitter.lock() {
            Ok(mut emitter) => {
                emitter.emit(ITEM_FAILED_EVENT, notice);
            }
            Err(_) => warn!("failure listener registry poisoned; notice dropped"),
        }
    }
}

impl<S: LocalStore> SyncQueue<S> {
    /// Persist a mutation on its own.
    pub fn enqueue(
        &self,
        user_id: impl Into<String>,
        mutation: Mutation,
        options: EnqueueOptions,
    ) -> Result<SyncQueueItem, QueueError> {
        let item = self.new_item(user_id, mutation, options);
        let appended = LocalCommit::new().enqueue(item).commit(self.store.as_ref())?;
        let item = appended
            .into_iter()
            .next()
            .ok_or_else(|| QueueError::ItemNotFound("just enqueued".into()))?;
        debug!(
            item_id = %item.id,
            entity_type = %item.entity_type,
            entity_id = %item.entity_id,
            "mutation enqueued"
        );
        Ok(item)
    }

    pub fn get(&self, id: &str) -> Result<Option<SyncQueueItem>, QueueError> {
        Ok(self.store.with_queue(|queue| queue.get(id).cloned())?)
    }

    /// Every item, by priority then enqueue order.
    pub fn items(&self) -> Result<Vec<SyncQueueItem>, QueueError> {
        Ok(self
            .store
            .with_queue(|queue| queue.ordered().into_iter().cloned().collect())?)
    }

    /// Items that need user attention.
    pub fn list_failed(&self) -> Result<Vec<SyncQueueItem>, QueueError> {
        Ok(self.store.with_queue(|queue| {
            queue
                .ordered()
                .into_iter()
                .filter(|item| item.is_failed())
                .cloned()
                .collect()
        })?)
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.with_queue(|queue| {
            queue.iter().fold(QueueStats::default(), |mut stats, item| {
                match item.status {
                    QueueStatus::Pending => stats.pending += 1,
                    QueueStatus::InFlight => stats.in_flight += 1,
                    QueueStatus::Retrying => stats.retrying += 1,
                    QueueStatus::Failed => stats.failed += 1,
                }
                stats
            })
        })?)
    }

    /// Manually re-arm a Failed item with a fresh attempt budget.
    pub fn retry(&self, id: &str) -> Result<SyncQueueItem, QueueError> {
        let now = self.clock.now();
        let item = self.store.with_queue(|queue| {
            let item = queue
                .get_mut(id)
                .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?;
            if !item.rearm(now) {
                return Err(QueueError::NotFailed {
                    id: id.to_string(),
                    status: item.status,
                });
            }
            Ok(item.clone())
        })??;
        info!(item_id = %item.id, entity_id = %item.entity_id, "failed sync item re-armed");
        Ok(item)
    }

    /// Cancel an item that has not been delivered yet.
    ///
    /// Cancelling a create also drops the items that depend on it: later
    /// changes to the same entity, and the whole rest of the batch when the
    /// batch is named after that entity. Cancelling a session create thus
    /// keeps its climbs from reaching the remote without their session. The
    /// local rows stay as they are.
    pub fn cancel(&self, id: &str) -> Result<CancelOutcome, QueueError> {
        let outcome = self.store.with_queue(|queue| {
            let status = queue
                .get(id)
                .map(|item| item.status)
                .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?;
            match status {
                QueueStatus::Pending | QueueStatus::Retrying => {
                    let mut removed = queue.remove_with_dependents(id).into_iter();
                    let item = removed
                        .next()
                        .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?;
                    Ok(CancelOutcome::Cancelled {
                        item,
                        dependents: removed.collect(),
                    })
                }
                QueueStatus::InFlight => {
                    if let Some(item) = queue.get_mut(id) {
                        item.cancel_requested = true;
                    }
                    Ok(CancelOutcome::Deferred)
                }
                QueueStatus::Failed => Err(QueueError::NotCancellable {
                    id: id.to_string(),
                    status,
                }),
            }
        })??;
        match &outcome {
            CancelOutcome::Cancelled { dependents, .. } => {
                debug!(item_id = %id, dependents = dependents.len(), "sync item cancelled")
            }
            CancelOutcome::Deferred => debug!(item_id = %id, "sync item cancellation deferred"),
        }
        Ok(outcome)
    }

    /// Delete one Failed item, with the queued items that depend on it as
    /// described for [`cancel`](Self::cancel).
    ///
    /// Returns every removed item, the failed one first.
    pub fn purge(&self, id: &str) -> Result<Vec<SyncQueueItem>, QueueError> {
        let removed = self.store.with_queue(|queue| {
            let status = queue
                .get(id)
                .map(|item| item.status)
                .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?;
            if status != QueueStatus::Failed {
                return Err(QueueError::NotFailed {
                    id: id.to_string(),
                    status,
                });
            }
            Ok(queue.remove_with_dependents(id))
        })??;
        info!(item_id = %id, removed = removed.len(), "failed sync item purged");
        Ok(removed)
    }

    /// Delete every Failed item and the queued items that depend on them.
    pub fn purge_failed(&self) -> Result<Vec<SyncQueueItem>, QueueError> {
        let removed = self.store.with_queue(|queue| {
            let failed: Vec<String> = queue
                .iter()
                .filter(|item| item.is_failed())
                .map(|item| item.id.clone())
                .collect();
            failed
                .iter()
                .flat_map(|id| queue.remove_with_dependents(id))
                .collect::<Vec<_>>()
        })?;
        if !removed.is_empty() {
            info!(removed = removed.len(), "failed sync items purged");
        }
        Ok(removed)
    }

    /// Return items left InFlight by an interrupted drain to Pending.
    pub fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let recovered = self.store.with_queue(|queue| {
            queue
                .iter_mut()
                .map(|item| item.recover(now))
                .filter(|recovered| *recovered)
                .count()
        })?;
        if recovered > 0 {
            warn!(recovered, "recovered interrupted sync items");
        }
        Ok(recovered)
    }

    /// Select the next due item and mark it InFlight.
    pub(crate) fn claim_next(&self) -> Result<Option<SyncQueueItem>, QueueError> {
        let now = self.clock.now();
        let claimed = self.store.with_queue(|queue| {
            let id = next_due(queue, now)?;
            let item = queue.get_mut(&id)?;
            item.claim();
            Some(item.clone())
        })?;
        if let Some(item) = &claimed {
            debug!(
                item_id = %item.id,
                entity_type = %item.entity_type,
                entity_id = %item.entity_id,
                attempt = item.attempts,
                "sync item claimed"
            );
        }
        Ok(claimed)
    }

    /// Remote version to send with `item`.
    pub(crate) fn expected_version(&self, item: &SyncQueueItem) -> Result<Option<u64>, QueueError> {
        if item.expected_version.is_some() {
            return Ok(item.expected_version);
        }
        if item.operation == Operation::Create {
            return Ok(None);
        }
        let key = RemoteVersion::key(item.entity_type, &item.entity_id);
        Ok(self
            .store
            .get::<RemoteVersion>(&key)?
            .map(|stored| stored.data.version))
    }

    /// Record the acknowledged remote version and delete the item.
    pub(crate) fn acknowledge(&self, item: &SyncQueueItem, version: u64) -> Result<Settled, QueueError> {
        let key = RemoteVersion::key(item.entity_type, &item.entity_id);
        let commit = if item.operation == Operation::Delete {
            match self.store.get::<RemoteVersion>(&key)? {
                Some(_) => LocalCommit::new().delete::<RemoteVersion>(key, None),
                None => LocalCommit::new(),
            }
        } else {
            LocalCommit::new().put(&RemoteVersion { id: key, version })?
        };
        if !commit.is_empty() {
            commit.commit(self.store.as_ref())?;
        }

        self.store.with_queue(|queue| queue.remove(&item.id))?;
        info!(
            item_id = %item.id,
            entity_type = %item.entity_type,
            entity_id = %item.entity_id,
            version,
            "sync item acknowledged"
        );
        Ok(Settled::Acknowledged)
    }

    /// Schedule another attempt, or fail the item once attempts run out.
    pub(crate) fn reschedule(
        &self,
        id: &str,
        error: &str,
        delay: Duration,
    ) -> Result<Settled, QueueError> {
        let now = self.clock.now();
        let settled = self.settle(id, |item| {
            if item.attempts_exhausted() {
                item.fail(Failure::exhausted(error, now));
                Settled::Failed(item.clone())
            } else {
                item.reschedule(error, delay, now);
                Settled::Rescheduled(item.clone())
            }
        })?;
        match &settled {
            Settled::Rescheduled(item) => warn!(
                item_id = %item.id,
                attempts = item.attempts,
                max_attempts = item.max_attempts,
                delay_ms = item.last_delay_ms.unwrap_or_default(),
                error,
                "sync delivery failed; retry scheduled"
            ),
            Settled::Failed(item) => self.notify_failed(item),
            _ => {}
        }
        Ok(settled)
    }

    /// Resend against `remote_version` after a conflict resolved locally.
    pub(crate) fn rebase(&self, id: &str, remote_version: u64) -> Result<Settled, QueueError> {
        let now = self.clock.now();
        let settled = self.settle(id, |item| {
            if item.attempts_exhausted() {
                item.fail(Failure::exhausted(
                    format!("conflict with remote version {remote_version} kept recurring"),
                    now,
                ));
                Settled::Failed(item.clone())
            } else {
                item.rebase(remote_version, now);
                Settled::Rebased(item.clone())
            }
        })?;
        match &settled {
            Settled::Rebased(item) => info!(
                item_id = %item.id,
                remote_version,
                "conflict resolved in favour of local change"
            ),
            Settled::Failed(item) => self.notify_failed(item),
            _ => {}
        }
        Ok(settled)
    }

    pub(crate) fn fail(&self, id: &str, failure: Failure) -> Result<Settled, QueueError> {
        let settled = self.settle(id, |item| {
            item.fail(failure);
            Settled::Failed(item.clone())
        })?;
        if let Settled::Failed(item) = &settled {
            self.notify_failed(item);
        }
        Ok(settled)
    }

    /// Apply a post-attempt transition, honoring a pending cancellation.
    fn settle(
        &self,
        id: &str,
        transition: impl FnOnce(&mut SyncQueueItem) -> Settled,
    ) -> Result<Settled, QueueError> {
        let settled = self.store.with_queue(|queue| {
            let cancelled = queue
                .get(id)
                .map(|item| item.cancel_requested)
                .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?;
            if cancelled {
                let mut removed = queue.remove_with_dependents(id).into_iter();
                let item = removed
                    .next()
                    .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?;
                let dependents = removed.count();
                if dependents > 0 {
                    debug!(item_id = %id, dependents, "dependent sync items dropped");
                }
                return Ok(Settled::Cancelled(item));
            }
            queue
                .get_mut(id)
                .map(transition)
                .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))
        })??;
        if let Settled::Cancelled(item) = &settled {
            debug!(item_id = %item.id, "deferred cancellation honored");
        }
        Ok(settled)
    }
}

/// The due item that should be delivered next, if any.
///
/// Candidates are taken by priority then enqueue order. An item in a batch
/// waits while any earlier item of the same batch is still queued, whatever
/// its state, so a failed item halts the rest of its batch.
fn next_due(queue: &QueueTable, now: chrono::DateTime<chrono::Utc>) -> Option<String> {
    queue
        .ordered()
        .into_iter()
        .find(|item| item.is_due(now) && !waits_on_batch(queue, item))
        .map(|item| item.id.clone())
}

fn waits_on_batch(queue: &QueueTable, item: &SyncQueueItem) -> bool {
    let Some(batch) = item.batch_id.as_deref() else {
        return false;
    };
    queue
        .iter()
        .any(|other| other.batch_id.as_deref() == Some(batch) && other.seq < item.seq)
}
