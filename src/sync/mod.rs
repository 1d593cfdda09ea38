//! Sync queue - the durable outbox between the local store and the remote
//! authority.
//!
//! Every local mutation is committed together with a [`SyncQueueItem`]. A
//! single [`SyncWorker`] drains the queue in priority order, keeps batches
//! in enqueue order, retries transient failures with exponential backoff,
//! and settles conflicts through a [`ConflictPolicy`].
//!
//! Item lifecycle:
//!
//! ```text
//! Pending -> InFlight -> acknowledged (deleted)
//!                     -> Retrying -> Pending ...
//!                     -> Failed -> Pending (manual retry) | purged
//! ```

mod backoff;
mod conflict;
mod item;
mod queue;
mod remote;
mod thread;
mod worker;

pub use backoff::RetryPolicy;
pub use conflict::{ConflictPolicy, LastWriteWins, ManualReview, Resolution};
pub use item::{
    EnqueueOptions, EntityType, Failure, FailureKind, Mutation, Operation, QueueStatus,
    SyncQueueItem, Syncable,
};
#[cfg(feature = "emitter")]
pub use queue::ITEM_FAILED_EVENT;
pub use queue::{
    CancelOutcome, FailedItemNotice, QueueError, QueueStats, RemoteVersion, Settled, SyncQueue,
};
pub use remote::{
    DeliveryError, InMemoryRemote, RemoteAuthority, RemoteMutation, RemoteOutcome,
    RemoteSnapshot,
};
pub use thread::{SyncWorkerThread, WorkerStats};
pub use worker::{DrainResult, ProcessOneResult, SyncWorker};
