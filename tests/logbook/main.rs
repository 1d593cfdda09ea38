mod fixtures;

use std::thread;

use logbook_sync::sync::{EntityType, Operation};
use logbook_sync::{ClimbResult, ClimbUpdate, LocalCommit, LogbookError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fixtures::{lead, Fixture};

const RESULTS: [ClimbResult; 5] = [
    ClimbResult::Flash,
    ClimbResult::Redpoint,
    ClimbResult::Onsight,
    ClimbResult::Attempt,
    ClimbResult::Project,
];

// =============================================================================
// Counter maintenance
// =============================================================================

#[test]
fn gym_session_counts_climbs_and_completions() {
    let fx = Fixture::new();
    let session = fx.logbook.start_session("u-1", "Gym A").unwrap();
    assert_eq!(session.location, "Gym A");

    fx.logbook
        .log_climb(lead(&session.id, "5.10a", ClimbResult::Flash))
        .unwrap();
    let attempt = fx
        .logbook
        .log_climb(lead(&session.id, "5.11c", ClimbResult::Attempt))
        .unwrap();
    fx.logbook
        .log_climb(lead(&session.id, "5.10d", ClimbResult::Redpoint))
        .unwrap();
    assert_eq!(fx.counters(&session.id), (3, 2));

    fx.logbook.delete_climb(&attempt.id).unwrap();
    assert_eq!(fx.counters(&session.id), (2, 2));
}

#[test]
fn every_mutation_enqueues_one_item_in_the_session_batch() {
    let fx = Fixture::new();
    let session = fx.logbook.start_session("u-1", "Gym A").unwrap();
    let climb = fx
        .logbook
        .log_climb(lead(&session.id, "6a+", ClimbResult::Attempt))
        .unwrap();
    fx.logbook
        .update_climb(&climb.id, ClimbUpdate::result(ClimbResult::Redpoint))
        .unwrap();
    fx.logbook.delete_climb(&climb.id).unwrap();
    fx.logbook.close_session(&session.id).unwrap();

    let items = fx.logbook.queue().items().unwrap();
    let summary: Vec<(EntityType, Operation)> = items
        .iter()
        .map(|item| (item.entity_type, item.operation))
        .collect();
    assert_eq!(
        summary,
        [
            (EntityType::Session, Operation::Create),
            (EntityType::Climb, Operation::Create),
            (EntityType::Climb, Operation::Update),
            (EntityType::Climb, Operation::Delete),
            (EntityType::Session, Operation::Update),
        ]
    );
    let batch = format!("session:{}", session.id);
    assert!(items.iter().all(|item| item.batch_id.as_deref() == Some(batch.as_str())));
    assert!(items.iter().all(|item| item.user_id == "u-1"));
    assert!(items.windows(2).all(|pair| pair[0].seq < pair[1].seq));
}

#[test]
fn empty_update_writes_nothing() {
    let fx = Fixture::new();
    let session = fx.logbook.start_session("u-1", "Gym A").unwrap();
    let climb = fx
        .logbook
        .log_climb(lead(&session.id, "V3", ClimbResult::Flash))
        .unwrap();
    let queued = fx.logbook.queue().items().unwrap().len();

    let unchanged = fx
        .logbook
        .update_climb(&climb.id, ClimbUpdate::default())
        .unwrap();
    assert_eq!(unchanged, climb);
    assert_eq!(fx.logbook.queue().items().unwrap().len(), queued);
}

#[test]
fn concurrent_logging_serializes_on_the_session_counter() {
    let fx = Fixture::new();
    let session = fx.logbook.start_session("u-1", "Gym A").unwrap();

    thread::scope(|scope| {
        for worker in 0..4 {
            let logbook = fx.logbook.clone();
            let session_id = session.id.clone();
            scope.spawn(move || {
                for n in 0..10 {
                    let result = if (worker + n) % 2 == 0 {
                        ClimbResult::Flash
                    } else {
                        ClimbResult::Attempt
                    };
                    logbook.log_climb(lead(&session_id, "5.9", result)).unwrap();
                }
            });
        }
    });

    assert_eq!(fx.counters(&session.id), (40, 20));
    assert_eq!(fx.logbook.queue().items().unwrap().len(), 41);
}

// =============================================================================
// Reconciliation
// =============================================================================

#[test]
fn reconcile_matches_a_full_scan_after_any_sequence() {
    let fx = Fixture::new();
    let session = fx.logbook.start_session("u-1", "Gym A").unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let mut live: Vec<String> = Vec::new();

    for _ in 0..200 {
        let result = RESULTS[rng.random_range(0..RESULTS.len())];
        match rng.random_range(0..3) {
            0 => {
                let climb = fx
                    .logbook
                    .log_climb(lead(&session.id, "5.12a", result))
                    .unwrap();
                live.push(climb.id);
            }
            1 if !live.is_empty() => {
                let id = &live[rng.random_range(0..live.len())];
                fx.logbook
                    .update_climb(id, ClimbUpdate::result(result))
                    .unwrap();
            }
            2 if !live.is_empty() => {
                let id = live.swap_remove(rng.random_range(0..live.len()));
                fx.logbook.delete_climb(&id).unwrap();
            }
            _ => {}
        }
    }

    let report = fx.logbook.reconcile_counters(&session.id).unwrap();
    assert!(!report.drift);
    assert_eq!(
        (report.current.climbs, report.current.completed),
        fx.scanned_counters(&session.id)
    );
    assert_eq!(report.current.climbs as usize, live.len());
}

#[test]
fn reconcile_corrects_drifted_counters() {
    let fx = Fixture::new();
    let session = fx.logbook.start_session("u-1", "Gym A").unwrap();
    fx.logbook
        .log_climb(lead(&session.id, "5.10b", ClimbResult::Onsight))
        .unwrap();
    fx.logbook
        .log_climb(lead(&session.id, "5.11a", ClimbResult::Project))
        .unwrap();

    let mut drifted = fx.session(&session.id);
    drifted.climb_count = 7;
    drifted.completed_count = 5;
    LocalCommit::new()
        .put(&drifted)
        .unwrap()
        .commit(fx.store.as_ref())
        .unwrap();

    let report = fx.logbook.reconcile_counters(&session.id).unwrap();
    assert!(report.drift);
    assert_eq!((report.previous.climbs, report.previous.completed), (7, 5));
    assert_eq!((report.current.climbs, report.current.completed), (2, 1));
    assert_eq!(fx.counters(&session.id), (2, 1));

    assert!(!fx.logbook.reconcile_counters(&session.id).unwrap().drift);
}

#[test]
fn reconcile_recovers_a_climb_written_without_its_counter_update() {
    let fx = Fixture::new();
    let session = fx.logbook.start_session("u-1", "Gym A").unwrap();
    let climb = fx
        .logbook
        .log_climb(lead(&session.id, "7a", ClimbResult::Redpoint))
        .unwrap();

    // A second climb row lands without the matching adjustment.
    let mut orphan = climb.clone();
    orphan.id = "orphan".into();
    LocalCommit::new()
        .insert(&orphan)
        .unwrap()
        .commit(fx.store.as_ref())
        .unwrap();
    assert_eq!(fx.counters(&session.id), (1, 1));

    let report = fx.logbook.reconcile_counters(&session.id).unwrap();
    assert!(report.drift);
    assert_eq!(fx.counters(&session.id), (2, 2));
}

#[test]
fn drifted_counters_never_go_negative() {
    let fx = Fixture::new();
    let session = fx.logbook.start_session("u-1", "Gym A").unwrap();
    let climb = fx
        .logbook
        .log_climb(lead(&session.id, "V6", ClimbResult::Flash))
        .unwrap();

    let mut drifted = fx.session(&session.id);
    drifted.climb_count = 0;
    drifted.completed_count = 0;
    LocalCommit::new()
        .put(&drifted)
        .unwrap()
        .commit(fx.store.as_ref())
        .unwrap();

    fx.logbook.delete_climb(&climb.id).unwrap();
    assert_eq!(fx.counters(&session.id), (0, 0));
}

#[test]
fn closed_sessions_can_still_be_reconciled() {
    let fx = Fixture::new();
    let session = fx.logbook.start_session("u-1", "Gym A").unwrap();
    fx.logbook
        .log_climb(lead(&session.id, "5.8", ClimbResult::Flash))
        .unwrap();
    fx.logbook.close_session(&session.id).unwrap();

    let report = fx.logbook.reconcile_counters(&session.id).unwrap();
    assert!(!report.drift);
    assert!(matches!(
        fx.logbook.log_climb(lead(&session.id, "5.8", ClimbResult::Flash)),
        Err(LogbookError::SessionClosed(_))
    ));
}

#[test]
fn drifted_counters_of_a_closed_session_are_repaired_locally() {
    let fx = Fixture::new();
    let session = fx.logbook.start_session("u-1", "Gym A").unwrap();
    fx.logbook
        .log_climb(lead(&session.id, "6b", ClimbResult::Onsight))
        .unwrap();
    fx.logbook.close_session(&session.id).unwrap();

    let mut drifted = fx.session(&session.id);
    drifted.climb_count = 4;
    drifted.completed_count = 3;
    LocalCommit::new()
        .put(&drifted)
        .unwrap()
        .commit(fx.store.as_ref())
        .unwrap();
    let queued = fx.logbook.queue().items().unwrap().len();

    let report = fx.logbook.reconcile_counters(&session.id).unwrap();
    assert!(report.drift);
    assert_eq!(fx.counters(&session.id), (1, 1));
    assert!(fx.session(&session.id).ended_at.is_some());
    assert_eq!(fx.logbook.queue().items().unwrap().len(), queued);
}
