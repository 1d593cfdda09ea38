use std::sync::Arc;

use logbook_sync::{
    ClimbResult, ClimbStyle, InMemoryStore, Logbook, ManualClock, NewClimb, Session, SyncConfig,
    SyncQueue,
};

pub struct Fixture {
    pub store: Arc<InMemoryStore>,
    pub clock: ManualClock,
    pub logbook: Logbook<InMemoryStore>,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::default();
        let queue = SyncQueue::new(
            Arc::clone(&store),
            Arc::new(clock.clone()),
            SyncConfig::default(),
        );
        Self {
            store,
            clock,
            logbook: Logbook::new(queue),
        }
    }

    pub fn session(&self, id: &str) -> Session {
        self.logbook
            .session(id)
            .unwrap()
            .expect("session should exist")
    }

    pub fn counters(&self, id: &str) -> (u32, u32) {
        let session = self.session(id);
        (session.climb_count, session.completed_count)
    }

    /// Counters as a full scan of the session's climbs would compute them.
    pub fn scanned_counters(&self, id: &str) -> (u32, u32) {
        let climbs = self.logbook.climbs(id).unwrap();
        let completed = climbs.iter().filter(|climb| climb.is_successful()).count();
        (climbs.len() as u32, completed as u32)
    }
}

pub fn lead(session_id: &str, grade: &str, result: ClimbResult) -> NewClimb {
    NewClimb::new(session_id, grade, ClimbStyle::Lead, result)
}
