//! Aggregate counters - session-level reductions over climbs.
//!
//! Climb writes adjust the owning session's counters by a [`CounterDelta`]
//! inside the same local commit. The climbs remain authoritative:
//! [`CounterTotals::from_climbs`] recomputes the true values and
//! reconciliation overwrites the cache with them.

use serde::{Deserialize, Serialize};

use crate::model::{Climb, Session};

/// Counter values of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterTotals {
    pub climbs: u32,
    pub completed: u32,
}

impl CounterTotals {
    /// The cached counters stored on a session.
    pub fn of(session: &Session) -> Self {
        Self {
            climbs: session.climb_count,
            completed: session.completed_count,
        }
    }

    /// Full recomputation from a session's climbs.
    pub fn from_climbs<'a>(climbs: impl IntoIterator<Item = &'a Climb>) -> Self {
        climbs.into_iter().fold(Self::default(), |mut totals, climb| {
            totals.climbs += 1;
            if climb.is_successful() {
                totals.completed += 1;
            }
            totals
        })
    }

    /// Overwrite the session's cached counters.
    pub fn write_to(self, session: &mut Session) {
        session.climb_count = self.climbs;
        session.completed_count = self.completed;
    }
}

/// Signed change to a session's counters caused by one climb write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub climbs: i64,
    pub completed: i64,
}

impl CounterDelta {
    /// Delta for replacing `before` with `after`; `None` means absent.
    pub fn between(before: Option<&Climb>, after: Option<&Climb>) -> Self {
        let weight = |climb: Option<&Climb>| match climb {
            Some(climb) => (1, i64::from(climb.is_successful())),
            None => (0, 0),
        };
        let (climbs_before, completed_before) = weight(before);
        let (climbs_after, completed_after) = weight(after);
        Self {
            climbs: climbs_after - climbs_before,
            completed: completed_after - completed_before,
        }
    }

    pub fn for_insert(climb: &Climb) -> Self {
        Self::between(None, Some(climb))
    }

    pub fn for_delete(climb: &Climb) -> Self {
        Self::between(Some(climb), None)
    }

    pub fn is_zero(&self) -> bool {
        self.climbs == 0 && self.completed == 0
    }

    /// Apply the delta to a session's counters.
    ///
    /// Results are clamped so counters stay non-negative and
    /// `completed <= climbs`. Returns true when clamping was needed, which
    /// means the cache had already drifted.
    pub fn apply_to(self, session: &mut Session) -> bool {
        let climbs = i64::from(session.climb_count) + self.climbs;
        let completed = i64::from(session.completed_count) + self.completed;

        let clamped_climbs = climbs.clamp(0, i64::from(u32::MAX));
        let clamped_completed = completed.clamp(0, clamped_climbs);

        session.climb_count = clamped_climbs as u32;
        session.completed_count = clamped_completed as u32;
        clamped_climbs != climbs || clamped_completed != completed
    }
}
