//! Offline-first consistency core for a climbing logbook.
//!
//! - [`grade`] parses and orders grades within YDS, French, V-Scale and UIAA.
//! - [`Logbook`] records sessions and climbs, keeping each session's cached
//!   counters in step with its climbs.
//! - [`sync`] delivers every local mutation to the remote authority through a
//!   durable outbox with backoff, batch ordering and conflict handling.

pub mod clock;
pub mod config;
pub mod counters;
pub mod grade;
pub mod logbook;
pub mod model;
pub mod store;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use counters::{CounterDelta, CounterTotals};
pub use grade::{Grade, GradeError, GradeSystem};
pub use logbook::{Logbook, LogbookError, ReconcileReport};
pub use model::{Climb, ClimbResult, ClimbStyle, ClimbUpdate, Model, NewClimb, Session, Versioned};
pub use store::{InMemoryStore, LocalCommit, LocalStore, StoreError};
pub use sync::{
    CancelOutcome, DeliveryError, EnqueueOptions, InMemoryRemote, LastWriteWins, ManualReview,
    Mutation, QueueError, QueueStatus, RemoteAuthority, SyncQueue, SyncQueueItem, SyncWorker,
    SyncWorkerThread,
};

// Re-export the EventEmitter from the event_emitter_rs crate
#[cfg(feature = "emitter")]
pub use event_emitter_rs::EventEmitter;
