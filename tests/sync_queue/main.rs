
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use logbook_sync::sync::{
    CancelOutcome, DeliveryError, EnqueueOptions, EntityType, FailureKind, ManualReview, Mutation,
    QueueStatus, RemoteAuthority, RemoteOutcome, RetryPolicy,
};
use logbook_sync::{
    ClimbResult, LocalCommit, Session, SyncConfig, SyncWorker, SyncWorkerThread,
};

use fixtures::{boulder, remote_edit, wait_until, Harness};

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn climb_waits_until_its_session_is_acknowledged() {
    let h = Harness::new();
    let session = h.logbook.start_session("u-1", "Gym A").unwrap();
    h.logbook
        .log_climb(boulder(&session.id, "V4", ClimbResult::Flash))
        .unwrap();
    h.remote
        .fail_next(DeliveryError::Network("connection reset".into()));

    assert!(h.worker.process_next().unwrap().rescheduled);
    let items = h.queue().items().unwrap();
    let session_item = items
        .iter()
        .find(|item| item.entity_type == EntityType::Session)
        .unwrap();
    let climb_item = items
        .iter()
        .find(|item| item.entity_type == EntityType::Climb)
        .unwrap();
    assert_eq!(session_item.status, QueueStatus::Retrying);
    assert_eq!(climb_item.status, QueueStatus::Pending);

    // The session is not due yet and the climb may not overtake it.
    assert!(!h.worker.process_next().unwrap().did_work);
    assert_eq!(h.remote.delivery_count(), 1);

    h.advance_to_retry(session_item);
    let drained = h.worker.drain().unwrap();
    assert_eq!(drained.acknowledged, 2);

    let order: Vec<EntityType> = h
        .remote
        .deliveries()
        .iter()
        .map(|request| request.mutation.entity_type)
        .collect();
    assert_eq!(
        order,
        [EntityType::Session, EntityType::Session, EntityType::Climb]
    );
    assert!(h.queue().items().unwrap().is_empty());
}

#[test]
fn rejected_item_halts_only_its_own_batch() {
    let h = Harness::new();
    let first = h.logbook.start_session("u-1", "Gym A").unwrap();
    let bad = h
        .logbook
        .log_climb(boulder(&first.id, "V9", ClimbResult::Flash))
        .unwrap();
    let after = h
        .logbook
        .log_climb(boulder(&first.id, "V2", ClimbResult::Attempt))
        .unwrap();
    let second = h.logbook.start_session("u-2", "Gym B").unwrap();
    h.remote.reject_entity(&bad.id, "grade not allowed here");

    let drained = h.worker.drain().unwrap();
    assert_eq!(drained.claimed, 3);
    assert_eq!(drained.acknowledged, 2);
    assert_eq!(drained.failed, 1);
    assert!(h.remote.snapshot(EntityType::Session, &second.id).is_some());
    assert!(h.remote.snapshot(EntityType::Climb, &after.id).is_none());

    let stats = h.queue().stats().unwrap();
    assert_eq!((stats.failed, stats.pending), (1, 1));
    let failed = h.queue().list_failed().unwrap();
    assert_eq!(failed[0].entity_id, bad.id);
    assert_eq!(failed[0].attempts, 1);
    let failure = failed[0].failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::Rejected);
    assert_eq!(failure.reason, "grade not allowed here");

    assert_eq!(h.queue().purge_failed().unwrap().len(), 1);
    assert_eq!(h.worker.drain().unwrap().acknowledged, 1);
    assert!(h.remote.snapshot(EntityType::Climb, &after.id).is_some());
}

// =============================================================================
// Retry and backoff
// =============================================================================

#[test]
fn unreachable_remote_fails_after_exactly_max_attempts() {
    let h = Harness::new();
    h.logbook.start_session("u-1", "Gym A").unwrap();
    h.remote.go_offline("maintenance");
    let id = h.only_item().id;
    let policy = RetryPolicy::default();
    let max_attempts = SyncConfig::default().max_attempts;

    let mut delays = Vec::new();
    for attempt in 1..=max_attempts {
        let processed = h.worker.process_next().unwrap();
        assert!(processed.did_work);
        let item = h.item(&id);
        assert_eq!(item.attempts, attempt);

        if attempt < max_attempts {
            assert!(processed.rescheduled);
            assert_eq!(item.status, QueueStatus::Retrying);
            let delay = item.last_delay_ms.unwrap();
            let raw = policy.raw_delay(attempt).as_millis() as u64;
            assert!(
                (raw..=raw + raw / 4).contains(&delay),
                "attempt {attempt}: delay {delay}ms outside [{raw}, {}]",
                raw + raw / 4
            );
            assert_eq!(
                item.next_retry - h.now(),
                chrono::Duration::milliseconds(delay as i64)
            );
            delays.push(delay);
            h.advance_to_retry(&item);
        } else {
            assert!(processed.failed);
        }
    }

    let item = h.item(&id);
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(
        item.failure.as_ref().unwrap().kind,
        FailureKind::AttemptsExhausted
    );
    assert_eq!(h.remote.delivery_count(), max_attempts as usize);
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(!h.worker.process_next().unwrap().did_work);
}

#[test]
fn manual_retry_rearms_a_failed_item() {
    let h = Harness::with_config(SyncConfig::default().with_max_attempts(1));
    h.logbook.start_session("u-1", "Gym A").unwrap();
    h.remote.go_offline("maintenance");

    assert!(h.worker.process_next().unwrap().failed);
    let failed = h.only_item();

    h.remote.go_online();
    let rearmed = h.queue().retry(&failed.id).unwrap();
    assert_eq!(rearmed.status, QueueStatus::Pending);
    assert_eq!(rearmed.attempts, 0);

    assert!(h.worker.process_next().unwrap().acknowledged);
    assert!(h.queue().items().unwrap().is_empty());
}

// =============================================================================
// Idempotence and timeouts
// =============================================================================

#[test]
fn timed_out_delivery_is_applied_once() {
    let h = Harness::with_config(
        SyncConfig::default().with_delivery_timeout(Duration::from_millis(50)),
    );
    let session = h.logbook.start_session("u-1", "Gym A").unwrap();
    h.remote.set_latency(Some(Duration::from_millis(250)));

    assert!(h.worker.process_next().unwrap().rescheduled);
    let item = h.only_item();
    assert!(item.last_error.as_deref().unwrap().contains("timed out"));

    // The slow attempt still lands remotely.
    h.remote.set_latency(None);
    assert!(wait_until(Duration::from_secs(2), || h.remote.applied_count() == 1));

    h.advance_to_retry(&item);
    assert!(h.worker.process_next().unwrap().acknowledged);
    assert_eq!(h.remote.delivery_count(), 2);
    assert_eq!(h.remote.applied_count(), 1);
    let snapshot = h.remote.snapshot(EntityType::Session, &session.id).unwrap();
    assert_eq!(snapshot.version, 1);
}

#[test]
fn redelivering_an_acknowledged_mutation_changes_nothing() {
    let h = Harness::new();
    let session = h.logbook.start_session("u-1", "Gym A").unwrap();
    h.worker.drain().unwrap();

    let request = h.remote.deliveries()[0].clone();
    let before = h.remote.snapshot(EntityType::Session, &session.id);
    assert_eq!(
        h.remote.apply_mutation(&request).unwrap(),
        RemoteOutcome::Acknowledged { version: 1 }
    );
    assert_eq!(h.remote.snapshot(EntityType::Session, &session.id), before);
    assert_eq!(h.remote.applied_count(), 1);
}

// =============================================================================
// Conflicts
// =============================================================================

#[test]
fn newer_local_change_wins_a_conflict() {
    let h = Harness::new();
    let session = h.logbook.start_session("u-1", "Gym A").unwrap();
    h.worker.drain().unwrap();
    let synced = h.remote.snapshot(EntityType::Session, &session.id).unwrap();

    h.clock.advance(chrono::Duration::minutes(1));
    h.remote.put_snapshot(remote_edit(&synced, h.now()));
    h.clock.advance(chrono::Duration::minutes(1));
    h.logbook.close_session(&session.id).unwrap();

    let drained = h.worker.drain().unwrap();
    assert_eq!(drained.rebased, 1);
    assert_eq!(drained.acknowledged, 1);

    let remote = h.remote.snapshot(EntityType::Session, &session.id).unwrap();
    assert_eq!(remote.version, 3);
    assert!(!remote.payload["ended_at"].is_null());
    assert!(h.queue().items().unwrap().is_empty());
}

#[test]
fn older_local_change_is_failed_with_the_remote_snapshot() {
    let h = Harness::new();
    let session = h.logbook.start_session("u-1", "Gym A").unwrap();
    h.worker.drain().unwrap();
    let synced = h.remote.snapshot(EntityType::Session, &session.id).unwrap();

    h.clock.advance(chrono::Duration::minutes(1));
    h.logbook.close_session(&session.id).unwrap();
    h.clock.advance(chrono::Duration::minutes(1));
    h.remote.put_snapshot(remote_edit(&synced, h.now()));

    assert_eq!(h.worker.drain().unwrap().failed, 1);
    let failed = h.queue().list_failed().unwrap();
    let failure = failed[0].failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::Conflict);
    let snapshot = failure.remote_snapshot.as_ref().unwrap();
    assert_eq!(snapshot.version, 2);
    assert_eq!(snapshot.payload["location"], "Gym B");

    // Re-arming keeps the local change and overwrites the remote version.
    let rearmed = h.queue().retry(&failed[0].id).unwrap();
    assert_eq!(rearmed.expected_version, Some(2));
    assert_eq!(h.worker.drain().unwrap().acknowledged, 1);
    assert_eq!(
        h.remote
            .snapshot(EntityType::Session, &session.id)
            .unwrap()
            .version,
        3
    );
}

#[test]
fn deleting_an_entity_the_remote_already_deleted_converges() {
    let h = Harness::new();
    let session = h.logbook.start_session("u-1", "Gym A").unwrap();
    let climb = h
        .logbook
        .log_climb(boulder(&session.id, "V5", ClimbResult::Redpoint))
        .unwrap();
    h.worker.drain().unwrap();

    let mut tombstone = h.remote.snapshot(EntityType::Climb, &climb.id).unwrap();
    tombstone.version += 1;
    tombstone.deleted = true;
    h.clock.advance(chrono::Duration::minutes(1));
    tombstone.updated_at = h.now();
    h.remote.put_snapshot(tombstone);

    h.clock.advance(chrono::Duration::minutes(1));
    h.logbook.delete_climb(&climb.id).unwrap();

    let drained = h.worker.drain().unwrap();
    assert_eq!((drained.acknowledged, drained.failed), (1, 0));
    assert!(h.queue().list_failed().unwrap().is_empty());
    assert!(h.queue().items().unwrap().is_empty());
    assert!(h.remote.snapshot(EntityType::Climb, &climb.id).unwrap().deleted);
}

#[test]
fn bare_conflict_reports_fetch_the_remote_snapshot() {
    let h = Harness::new();
    let session = h.logbook.start_session("u-1", "Gym A").unwrap();
    h.worker.drain().unwrap();
    let synced = h.remote.snapshot(EntityType::Session, &session.id).unwrap();

    h.logbook.close_session(&session.id).unwrap();
    h.clock.advance(chrono::Duration::minutes(1));
    h.remote.put_snapshot(remote_edit(&synced, h.now()));
    h.remote.report_bare_conflicts(true);

    assert_eq!(h.worker.drain().unwrap().failed, 1);
    let failed = h.queue().list_failed().unwrap();
    let snapshot = failed[0]
        .failure
        .as_ref()
        .and_then(|failure| failure.remote_snapshot.as_ref())
        .expect("snapshot fetched from the remote");
    assert_eq!(snapshot.version, 2);
}

#[test]
fn manual_review_sends_every_conflict_to_the_user() {
    let h = Harness::new();
    let worker = SyncWorker::new(h.queue().clone(), Arc::new(h.remote.clone()))
        .with_conflict_policy(ManualReview);
    let session = h.logbook.start_session("u-1", "Gym A").unwrap();
    worker.drain().unwrap();
    let synced = h.remote.snapshot(EntityType::Session, &session.id).unwrap();

    h.remote.put_snapshot(remote_edit(&synced, h.now()));
    h.clock.advance(chrono::Duration::minutes(5));
    h.logbook.close_session(&session.id).unwrap();

    let drained = worker.drain().unwrap();
    assert_eq!((drained.failed, drained.rebased), (1, 0));
    assert_eq!(
        h.queue().list_failed().unwrap()[0]
            .failure
            .as_ref()
            .unwrap()
            .kind,
        FailureKind::Conflict
    );
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn pending_item_is_cancelled_before_delivery() {
    let h = Harness::new();
    h.logbook.start_session("u-1", "Gym A").unwrap();
    let item = h.only_item();

    match h.queue().cancel(&item.id).unwrap() {
        CancelOutcome::Cancelled { item: removed, dependents } => {
            assert_eq!(removed.id, item.id);
            assert!(dependents.is_empty());
        }
        other => panic!("expected immediate cancellation, got {other:?}"),
    }
    assert!(!h.worker.process_next().unwrap().did_work);
    assert_eq!(h.remote.delivery_count(), 0);
}

#[test]
fn cancelling_a_session_create_drops_its_climbs() {
    let h = Harness::new();
    let session = h.logbook.start_session("u-1", "Gym A").unwrap();
    let session_item = h.only_item();
    h.logbook
        .log_climb(boulder(&session.id, "V2", ClimbResult::Flash))
        .unwrap();
    h.logbook
        .log_climb(boulder(&session.id, "V4", ClimbResult::Attempt))
        .unwrap();
    let other = h.logbook.start_session("u-1", "Gym B").unwrap();

    match h.queue().cancel(&session_item.id).unwrap() {
        CancelOutcome::Cancelled { dependents, .. } => {
            assert_eq!(dependents.len(), 2);
            assert!(dependents
                .iter()
                .all(|item| item.entity_type == EntityType::Climb));
        }
        other => panic!("expected immediate cancellation, got {other:?}"),
    }

    assert_eq!(h.worker.drain().unwrap().acknowledged, 1);
    assert!(h.remote.snapshot(EntityType::Session, &other.id).is_some());
    assert!(h
        .remote
        .deliveries()
        .iter()
        .all(|request| request.mutation.entity_type == EntityType::Session));
    // Local rows are untouched.
    assert_eq!(h.logbook.climbs(&session.id).unwrap().len(), 2);
}

#[test]
fn purging_a_rejected_session_create_drops_its_climbs() {
    let h = Harness::new();
    let session = h.logbook.start_session("u-1", "Gym A").unwrap();
    h.logbook
        .log_climb(boulder(&session.id, "V3", ClimbResult::Redpoint))
        .unwrap();
    h.remote.reject_entity(&session.id, "location unknown");

    assert_eq!(h.worker.drain().unwrap().failed, 1);
    let failed = h.queue().list_failed().unwrap();
    let removed = h.queue().purge(&failed[0].id).unwrap();
    assert_eq!(removed.len(), 2);
    assert_eq!(removed[0].id, failed[0].id);

    assert!(h.queue().items().unwrap().is_empty());
    assert_eq!(h.worker.drain().unwrap().claimed, 0);
    assert_eq!(h.remote.delivery_count(), 1);
}

#[test]
fn in_flight_cancel_waits_for_the_attempt() {
    let h = Harness::new();
    h.logbook.start_session("u-1", "Gym A").unwrap();
    let item = h.only_item();
    h.remote.set_latency(Some(Duration::from_millis(300)));
    h.remote.go_offline("flaky uplink");

    thread::scope(|scope| {
        let attempt = scope.spawn(|| h.worker.process_next().unwrap());
        assert!(wait_until(Duration::from_secs(1), || {
            h.queue().stats().unwrap().in_flight == 1
        }));
        assert_eq!(h.queue().cancel(&item.id).unwrap(), CancelOutcome::Deferred);

        let processed = attempt.join().unwrap();
        assert!(processed.cancelled);
        assert!(!processed.rescheduled);
    });
    assert!(h.queue().items().unwrap().is_empty());
}

#[test]
fn in_flight_cancel_loses_to_an_acknowledgment() {
    let h = Harness::new();
    let session = h.logbook.start_session("u-1", "Gym A").unwrap();
    let item = h.only_item();
    h.remote.set_latency(Some(Duration::from_millis(300)));

    thread::scope(|scope| {
        let attempt = scope.spawn(|| h.worker.process_next().unwrap());
        assert!(wait_until(Duration::from_secs(1), || {
            h.queue().stats().unwrap().in_flight == 1
        }));
        assert_eq!(h.queue().cancel(&item.id).unwrap(), CancelOutcome::Deferred);
        assert!(attempt.join().unwrap().acknowledged);
    });
    assert!(h.queue().items().unwrap().is_empty());
    assert!(h.remote.snapshot(EntityType::Session, &session.id).is_some());
}

// =============================================================================
// Background thread
// =============================================================================

#[test]
fn worker_thread_recovers_interrupted_items_and_drains() {
    let h = Harness::new();
    let session = h.logbook.start_session("u-1", "Gym A").unwrap();
    h.logbook
        .log_climb(boulder(&session.id, "V1", ClimbResult::Flash))
        .unwrap();
    h.logbook
        .log_climb(boulder(&session.id, "V3", ClimbResult::Project))
        .unwrap();

    // An item a previous run claimed but never settled.
    let crashed = Session::start("s-crashed", "u-1", "Gym C", h.now());
    let mut stranded = h.queue().new_item(
        "u-1",
        Mutation::create(&crashed, h.now()).unwrap(),
        EnqueueOptions::default(),
    );
    stranded.status = QueueStatus::InFlight;
    stranded.attempts = 1;
    LocalCommit::new()
        .enqueue(stranded)
        .commit(h.store.as_ref())
        .unwrap();

    let worker = SyncWorker::new(h.queue().clone(), Arc::new(h.remote.clone()));
    let thread = SyncWorkerThread::spawn(worker, Duration::from_millis(20));
    assert!(wait_until(Duration::from_secs(2), || {
        h.queue().stats().unwrap().total() == 0
    }));
    let stats = thread.stop();

    assert_eq!(stats.recovered, 1);
    assert_eq!(stats.acknowledged, 4);
    assert_eq!(stats.failed, 0);
    assert!(stats.polls >= 1);
    assert_eq!(h.remote.applied_count(), 4);
}

// =============================================================================
// Failure notifications
// =============================================================================

#[cfg(feature = "emitter")]
#[test]
fn failed_items_are_announced_to_listeners() {
    use logbook_sync::sync::FailedItemNotice;
    use std::sync::mpsc;

    let h = Harness::new();
    let (tx, rx) = mpsc::channel();
    h.queue()
        .on_item_failed(move |notice: FailedItemNotice| {
            let _ = tx.send(notice);
        })
        .unwrap();

    let session = h.logbook.start_session("u-1", "Gym A").unwrap();
    let climb = h
        .logbook
        .log_climb(boulder(&session.id, "V12", ClimbResult::Flash))
        .unwrap();
    h.remote.reject_entity(&climb.id, "suspicious grade");
    h.worker.drain().unwrap();

    let notice = rx
        .recv_timeout(Duration::from_secs(1))
        .expect("failure listener never fired");
    assert_eq!(notice.entity_type, EntityType::Climb);
    assert_eq!(notice.entity_id, climb.id);
    assert_eq!(notice.kind, FailureKind::Rejected);
    assert_eq!(notice.reason, "suspicious grade");
}
