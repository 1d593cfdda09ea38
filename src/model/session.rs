use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Model;

/// A climbing session with cached counters over its climbs.
///
/// `climb_count` and `completed_count` are a reduction over the session's
/// climbs, kept current by counter adjustments and recoverable by
/// reconciliation. `completed_count <= climb_count` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub location: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub climb_count: u32,
    pub completed_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn start(
        id: impl Into<String>,
        user_id: impl Into<String>,
        location: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            location: location.into(),
            started_at: now,
            ended_at: None,
            climb_count: 0,
            completed_count: 0,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Close the session. Returns false if it was already closed.
    pub fn close(&mut self, now: DateTime<Utc>) -> bool {
        if self.ended_at.is_some() {
            return false;
        }
        self.ended_at = Some(now);
        self.updated_at = now;
        true
    }
}

impl Model for Session {
    const COLLECTION: &'static str = "sessions";

    fn id(&self) -> &str {
        &self.id
    }
}
