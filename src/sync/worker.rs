use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::store::LocalStore;

use super::backoff::RetryPolicy;
use super::conflict::{ConflictPolicy, LastWriteWins, Resolution};
use super::item::{Failure, Operation, SyncQueueItem};
use super::queue::{QueueError, Settled, SyncQueue};
use super::remote::{DeliveryError, RemoteAuthority, RemoteMutation, RemoteOutcome, RemoteSnapshot};

/// Result of a drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainResult {
    pub claimed: usize,
    pub acknowledged: usize,
    pub rescheduled: usize,
    pub rebased: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl DrainResult {
    fn record(&mut self, processed: ProcessOneResult) {
        if processed.did_work {
            self.claimed += 1;
        }
        self.acknowledged += processed.acknowledged as usize;
        self.rescheduled += processed.rescheduled as usize;
        self.rebased += processed.rebased as usize;
        self.failed += processed.failed as usize;
        self.cancelled += processed.cancelled as usize;
    }
}

/// Result of delivering a single item.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOneResult {
    /// Whether an item was claimed and attempted.
    pub did_work: bool,
    pub acknowledged: bool,
    /// A retryable failure scheduled another attempt.
    pub rescheduled: bool,
    /// A conflict was resolved locally and the item resent.
    pub rebased: bool,
    pub failed: bool,
    /// A cancellation requested during the attempt was honored.
    pub cancelled: bool,
}

impl From<&Settled> for ProcessOneResult {
    fn from(settled: &Settled) -> Self {
        let mut result = ProcessOneResult {
            did_work: true,
            ..Default::default()
        };
        match settled {
            Settled::Acknowledged => result.acknowledged = true,
            Settled::Rescheduled(_) => result.rescheduled = true,
            Settled::Rebased(_) => result.rebased = true,
            Settled::Failed(_) => result.failed = true,
            Settled::Cancelled(_) => result.cancelled = true,
        }
        result
    }
}

/// Delivers queued mutations to the remote authority one at a time.
///
/// Each attempt runs on a helper thread bounded by the delivery timeout; an
/// attempt that outlives it counts as a retryable failure. A late reply is
/// harmless because the remote applies each `mutation_id` at most once.
pub struct SyncWorker<S, R> {
    queue: SyncQueue<S>,
    remote: Arc<R>,
    retry: RetryPolicy,
    conflicts: Arc<dyn ConflictPolicy>,
    timeout: Duration,
    batch_size: usize,
}

impl<S, R> SyncWorker<S, R> {
    /// Create a worker with the queue's configured backoff, timeout, and
    /// batch size, resolving conflicts by last write wins.
    pub fn new(queue: SyncQueue<S>, remote: Arc<R>) -> Self {
        let config = queue.config();
        let retry = RetryPolicy::from_config(config);
        let timeout = config.delivery_timeout();
        let batch_size = config.drain_batch_size;
        Self {
            queue,
            remote,
            retry,
            conflicts: Arc::new(LastWriteWins),
            timeout,
            batch_size,
        }
    }

    pub fn with_conflict_policy(mut self, policy: impl ConflictPolicy + 'static) -> Self {
        self.conflicts = Arc::new(policy);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Maximum items attempted per [`drain`](Self::drain).
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn queue(&self) -> &SyncQueue<S> {
        &self.queue
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }
}

impl<S, R> SyncWorker<S, R>
where
    S: LocalStore,
    R: RemoteAuthority + 'static,
{
    /// Claim and deliver the next due item, if any.
    ///
    /// A local error after the claim sends the item back for another attempt
    /// before it is returned, so no item is left InFlight.
    pub fn process_next(&self) -> Result<ProcessOneResult, QueueError> {
        let Some(item) = self.queue.claim_next()? else {
            return Ok(ProcessOneResult::default());
        };
        match self.attempt(&item) {
            Ok(settled) => Ok(ProcessOneResult::from(&settled)),
            Err(error) => {
                self.release(&item, &error);
                Err(error)
            }
        }
    }

    /// Deliver due items until none remain or the batch size is reached.
    pub fn drain(&self) -> Result<DrainResult, QueueError> {
        let mut result = DrainResult::default();
        for _ in 0..self.batch_size {
            let processed = self.process_next()?;
            if !processed.did_work {
                break;
            }
            result.record(processed);
        }
        if result.claimed > 0 {
            debug!(?result, "sync drain finished");
        }
        Ok(result)
    }

    fn attempt(&self, item: &SyncQueueItem) -> Result<Settled, QueueError> {
        let request = RemoteMutation {
            mutation_id: item.id.clone(),
            user_id: item.user_id.clone(),
            mutation: item.mutation(),
            expected_version: self.queue.expected_version(item)?,
        };

        match self.deliver(request) {
            Ok(RemoteOutcome::Acknowledged { version }) => self.queue.acknowledge(item, version),
            Ok(RemoteOutcome::Rejected { reason }) => {
                let now = self.queue.clock().now();
                self.queue.fail(&item.id, Failure::rejected(reason, now))
            }
            Ok(RemoteOutcome::Conflict { current }) => self.resolve_conflict(item, current),
            Err(error) => self.retry_later(item, &error),
        }
    }

    /// Return a claimed item to the queue after a local error.
    fn release(&self, item: &SyncQueueItem, error: &QueueError) {
        let delay = self.retry.delay_for(item.attempts);
        let reason = format!("local error during delivery: {error}");
        match self.queue.reschedule(&item.id, &reason, delay) {
            Ok(_) | Err(QueueError::ItemNotFound(_)) => {}
            Err(release_error) => warn!(
                item_id = %item.id,
                %error,
                %release_error,
                "could not release sync item after local error"
            ),
        }
    }

    fn deliver(&self, request: RemoteMutation) -> Result<RemoteOutcome, DeliveryError> {
        let remote = Arc::clone(&self.remote);
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(remote.apply_mutation(&request));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(DeliveryError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(DeliveryError::Unavailable(
                "delivery ended without a reply".into(),
            )),
        }
    }

    fn retry_later(&self, item: &SyncQueueItem, error: &DeliveryError) -> Result<Settled, QueueError> {
        let delay = self.retry.delay_for(item.attempts);
        self.queue.reschedule(&item.id, &error.to_string(), delay)
    }

    fn resolve_conflict(
        &self,
        item: &SyncQueueItem,
        current: Option<RemoteSnapshot>,
    ) -> Result<Settled, QueueError> {
        let snapshot = match current {
            Some(snapshot) => Some(snapshot),
            None => match self.remote.fetch_version(item.entity_type, &item.entity_id) {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    warn!(item_id = %item.id, %error, "could not fetch conflicting remote state");
                    return self.retry_later(item, &error);
                }
            },
        };

        let now = self.queue.clock().now();
        let Some(snapshot) = snapshot else {
            let reason = format!(
                "remote reported a conflict for unknown {} {}",
                item.entity_type, item.entity_id
            );
            return self.queue.fail(&item.id, Failure::rejected(reason, now));
        };

        // Both sides agree the entity is gone.
        if item.operation == Operation::Delete && snapshot.deleted {
            info!(
                item_id = %item.id,
                entity_id = %item.entity_id,
                version = snapshot.version,
                "remote already deleted the entity"
            );
            return self.queue.acknowledge(item, snapshot.version);
        }

        match self.conflicts.resolve(item, &snapshot) {
            Resolution::KeepLocal => self.queue.rebase(&item.id, snapshot.version),
            Resolution::KeepRemote => self.queue.fail(&item.id, Failure::conflict(snapshot, now)),
        }
    }
}
