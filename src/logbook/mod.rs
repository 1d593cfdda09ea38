//! Logbook - the application-facing service for sessions and climbs.
//!
//! Every mutation is a single [`LocalCommit`]: the entity write, the owning
//! session's counter adjustment, and the sync queue item for the remote
//! authority land together or not at all. All items of one session share
//! the batch `session:{id}`, so the remote never sees a climb before its
//! session.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::counters::{CounterDelta, CounterTotals};
use crate::grade::GradeError;
use crate::model::{Climb, ClimbUpdate, Model, NewClimb, Session, Versioned};
use crate::store::{LocalCommit, LocalStore, StoreError};
use crate::sync::{EnqueueOptions, Mutation, SyncQueue};

/// How many times a mutation is replayed after losing a local write race.
const MAX_WRITE_RETRIES: usize = 3;

#[derive(Debug, Error)]
pub enum LogbookError {
    #[error(transparent)]
    Grade(#[from] GradeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("climb {0} not found")]
    ClimbNotFound(String),
    #[error("session {0} is closed")]
    SessionClosed(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Outcome of [`Logbook::reconcile_counters`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub session_id: String,
    /// Cached counters before reconciliation.
    pub previous: CounterTotals,
    /// Counters recomputed from the session's climbs, now stored.
    pub current: CounterTotals,
    pub drift: bool,
}

pub struct Logbook<S> {
    store: Arc<S>,
    queue: SyncQueue<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for Logbook<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            queue: self.queue.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S> Logbook<S> {
    /// Create a logbook writing through the queue's store and clock.
    pub fn new(queue: SyncQueue<S>) -> Self {
        Self {
            store: Arc::clone(queue.store()),
            clock: Arc::clone(queue.clock()),
            queue,
        }
    }

    pub fn queue(&self) -> &SyncQueue<S> {
        &self.queue
    }

    fn batch(session_id: &str) -> EnqueueOptions {
        EnqueueOptions::default().batch(format!("session:{session_id}"))
    }
}

impl<S: LocalStore> Logbook<S> {
    pub fn start_session(
        &self,
        user_id: impl Into<String>,
        location: impl Into<String>,
    ) -> Result<Session, LogbookError> {
        let now = self.clock.now();
        let session = Session::start(Uuid::new_v4().to_string(), user_id, location, now);
        let item = self.queue.new_item(
            session.user_id.clone(),
            Mutation::create(&session, now)?,
            Self::batch(&session.id),
        );

        LocalCommit::new()
            .insert(&session)?
            .enqueue(item)
            .commit(self.store.as_ref())?;
        info!(session_id = %session.id, location = %session.location, "session started");
        Ok(session)
    }

    /// End a session. Closing an already closed session changes nothing.
    pub fn close_session(&self, session_id: &str) -> Result<Session, LogbookError> {
        self.with_retries("close_session", || {
            let stored = self.load_session(session_id)?;
            let version = stored.version;
            let mut session = stored.into_inner();
            let now = self.clock.now();
            if !session.close(now) {
                return Ok(session);
            }

            let item = self.queue.new_item(
                session.user_id.clone(),
                Mutation::update(&session, now)?,
                Self::batch(session_id),
            );
            LocalCommit::new()
                .replace(&session, version)?
                .enqueue(item)
                .commit(self.store.as_ref())?;
            info!(
                session_id,
                climbs = session.climb_count,
                completed = session.completed_count,
                "session closed"
            );
            Ok(session)
        })
    }

    pub fn log_climb(&self, new: NewClimb) -> Result<Climb, LogbookError> {
        let now = self.clock.now();
        let climb = new.into_climb(Uuid::new_v4().to_string(), now)?;

        self.with_retries("log_climb", || {
            let session = self.open_session(&climb.session_id)?;
            let item = self.queue.new_item(
                session.user_id,
                Mutation::create(&climb, now)?,
                Self::batch(&climb.session_id),
            );
            LocalCommit::new()
                .insert(&climb)?
                .adjust_counters(&climb.session_id, CounterDelta::for_insert(&climb))
                .enqueue(item)
                .commit(self.store.as_ref())?;
            debug!(
                climb_id = %climb.id,
                session_id = %climb.session_id,
                grade = %climb.grade,
                result = ?climb.result,
                "climb logged"
            );
            Ok(climb.clone())
        })
    }

    /// Edit a climb. Counters move only when the success classification
    /// changes; an empty update writes nothing.
    pub fn update_climb(&self, climb_id: &str, update: ClimbUpdate) -> Result<Climb, LogbookError> {
        self.with_retries("update_climb", || {
            let stored = self.load_climb(climb_id)?;
            if update.is_empty() {
                return Ok(stored.into_inner());
            }
            let session = self.open_session(&stored.data.session_id)?;
            let now = self.clock.now();
            let updated = update.apply_to(&stored.data, now)?;
            let delta = CounterDelta::between(Some(&stored.data), Some(&updated));

            let item = self.queue.new_item(
                session.user_id,
                Mutation::update(&updated, now)?,
                Self::batch(&updated.session_id),
            );
            LocalCommit::new()
                .replace(&updated, stored.version)?
                .adjust_counters(&updated.session_id, delta)
                .enqueue(item)
                .commit(self.store.as_ref())?;
            debug!(climb_id, session_id = %updated.session_id, "climb updated");
            Ok(updated)
        })
    }

    /// Remove a climb, returning it as it was.
    pub fn delete_climb(&self, climb_id: &str) -> Result<Climb, LogbookError> {
        self.with_retries("delete_climb", || {
            let stored = self.load_climb(climb_id)?;
            let session = self.open_session(&stored.data.session_id)?;
            let now = self.clock.now();
            let climb = &stored.data;

            let item = self.queue.new_item(
                session.user_id,
                Mutation::delete::<Climb>(&climb.id, now),
                Self::batch(&climb.session_id),
            );
            LocalCommit::new()
                .delete::<Climb>(&climb.id, Some(stored.version))
                .adjust_counters(&climb.session_id, CounterDelta::for_delete(climb))
                .enqueue(item)
                .commit(self.store.as_ref())?;
            debug!(climb_id, session_id = %climb.session_id, "climb deleted");
            Ok(stored.data.clone())
        })
    }

    /// Recompute a session's counters from its climbs and overwrite the
    /// cached values. Drift is logged and corrected, never returned as an
    /// error.
    ///
    /// This is the one write allowed on a closed session: counters are
    /// frozen against climb changes after closure, but a repair brings them
    /// back in line with the climbs recorded before it. The repair stays
    /// local and enqueues nothing.
    pub fn reconcile_counters(&self, session_id: &str) -> Result<ReconcileReport, LogbookError> {
        let report = self
            .store
            .update_session_with_climbs(session_id, |session, climbs| {
                let previous = CounterTotals::of(session);
                let current = CounterTotals::from_climbs(climbs);
                current.write_to(session);
                ReconcileReport {
                    session_id: session_id.to_string(),
                    previous,
                    current,
                    drift: previous != current,
                }
            })?
            .ok_or_else(|| LogbookError::SessionNotFound(session_id.to_string()))?;

        if report.drift {
            warn!(
                session_id,
                cached_climbs = report.previous.climbs,
                cached_completed = report.previous.completed,
                climbs = report.current.climbs,
                completed = report.current.completed,
                "counter drift corrected"
            );
        }
        Ok(report)
    }

    pub fn session(&self, session_id: &str) -> Result<Option<Session>, LogbookError> {
        Ok(self
            .store
            .get::<Session>(session_id)?
            .map(Versioned::into_inner))
    }

    pub fn sessions(&self, user_id: &str) -> Result<Vec<Session>, LogbookError> {
        let mut sessions: Vec<Session> = self
            .store
            .find::<Session>(&|session| session.user_id == user_id)?
            .into_iter()
            .map(Versioned::into_inner)
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    pub fn climb(&self, climb_id: &str) -> Result<Option<Climb>, LogbookError> {
        Ok(self.store.get::<Climb>(climb_id)?.map(Versioned::into_inner))
    }

    /// A session's climbs in logging order.
    pub fn climbs(&self, session_id: &str) -> Result<Vec<Climb>, LogbookError> {
        let mut climbs: Vec<Climb> = self
            .store
            .find::<Climb>(&|climb| climb.session_id == session_id)?
            .into_iter()
            .map(Versioned::into_inner)
            .collect();
        climbs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(climbs)
    }

    /// A session's climbs grouped by grading system, easiest first.
    pub fn climbs_by_grade(&self, session_id: &str) -> Result<Vec<Climb>, LogbookError> {
        let mut climbs = self.climbs(session_id)?;
        climbs.sort_by_key(|climb| (climb.grade.system(), climb.grade.sort_order()));
        Ok(climbs)
    }

    fn load_session(&self, session_id: &str) -> Result<Versioned<Session>, LogbookError> {
        self.store
            .get::<Session>(session_id)?
            .ok_or_else(|| LogbookError::SessionNotFound(session_id.to_string()))
    }

    fn open_session(&self, session_id: &str) -> Result<Session, LogbookError> {
        let session = self.load_session(session_id)?.into_inner();
        if !session.is_active() {
            return Err(LogbookError::SessionClosed(session.id));
        }
        Ok(session)
    }

    fn load_climb(&self, climb_id: &str) -> Result<Versioned<Climb>, LogbookError> {
        self.store
            .get::<Climb>(climb_id)?
            .ok_or_else(|| LogbookError::ClimbNotFound(climb_id.to_string()))
    }

    /// Run `attempt`, replaying it when a concurrent local writer got to a
    /// row first.
    fn with_retries<T>(
        &self,
        operation: &'static str,
        mut attempt: impl FnMut() -> Result<T, LogbookError>,
    ) -> Result<T, LogbookError> {
        let mut retries = 0;
        loop {
            match attempt() {
                Err(LogbookError::Store(StoreError::ConcurrentWrite { collection, id, .. }))
                    if retries < MAX_WRITE_RETRIES =>
                {
                    retries += 1;
                    debug!(operation, %collection, %id, retries, "local write raced; replaying");
                }
                Err(LogbookError::Store(StoreError::SessionClosed(id))) => {
                    return Err(LogbookError::SessionClosed(id));
                }
                Err(LogbookError::Store(StoreError::NotFound { collection, id }))
                    if collection == Climb::COLLECTION =>
                {
                    return Err(LogbookError::ClimbNotFound(id));
                }
                Err(LogbookError::Store(StoreError::NotFound { collection, id }))
                    if collection == Session::COLLECTION =>
                {
                    return Err(LogbookError::SessionNotFound(id));
                }
                other => return other,
            }
        }
    }
}
