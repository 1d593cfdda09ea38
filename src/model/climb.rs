use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::grade::{self, Grade, GradeError};

use super::Model;

/// Outcome of a climb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClimbResult {
    Flash,
    Redpoint,
    Onsight,
    Attempt,
    Project,
}

impl ClimbResult {
    /// Flash, redpoint and onsight count as completed; attempts and projects
    /// do not.
    pub fn is_successful(self) -> bool {
        matches!(
            self,
            ClimbResult::Flash | ClimbResult::Redpoint | ClimbResult::Onsight
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClimbStyle {
    Lead,
    TopRope,
    Boulder,
    Trad,
    Solo,
}

/// A single climb, owned by exactly one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Climb {
    pub id: String,
    pub session_id: String,
    pub grade: Grade,
    pub style: ClimbStyle,
    pub result: ClimbResult,
    pub attempts: u32,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Climb {
    pub fn is_successful(&self) -> bool {
        self.result.is_successful()
    }
}

impl Model for Climb {
    const COLLECTION: &'static str = "climbs";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Input for logging a climb. The grade is raw user input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewClimb {
    pub session_id: String,
    pub grade: String,
    pub style: ClimbStyle,
    pub result: ClimbResult,
    pub attempts: u32,
    pub notes: Option<String>,
}

impl NewClimb {
    pub fn new(
        session_id: impl Into<String>,
        grade: impl Into<String>,
        style: ClimbStyle,
        result: ClimbResult,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            grade: grade.into(),
            style,
            result,
            attempts: 1,
            notes: None,
        }
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub(crate) fn into_climb(self, id: String, now: DateTime<Utc>) -> Result<Climb, GradeError> {
        Ok(Climb {
            id,
            session_id: self.session_id,
            grade: grade::parse(&self.grade)?,
            style: self.style,
            result: self.result,
            attempts: self.attempts,
            notes: self.notes,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Field-level edit of a climb. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClimbUpdate {
    pub grade: Option<String>,
    pub style: Option<ClimbStyle>,
    pub result: Option<ClimbResult>,
    pub attempts: Option<u32>,
    pub notes: Option<Option<String>>,
}

impl ClimbUpdate {
    pub fn result(result: ClimbResult) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn grade(grade: impl Into<String>) -> Self {
        Self {
            grade: Some(grade.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.grade.is_none()
            && self.style.is_none()
            && self.result.is_none()
            && self.attempts.is_none()
            && self.notes.is_none()
    }

    /// Apply the edit to a copy of `climb`.
    pub fn apply_to(&self, climb: &Climb, now: DateTime<Utc>) -> Result<Climb, GradeError> {
        let mut updated = climb.clone();
        if let Some(raw) = &self.grade {
            updated.grade = grade::parse(raw)?;
        }
        if let Some(style) = self.style {
            updated.style = style;
        }
        if let Some(result) = self.result {
            updated.result = result;
        }
        if let Some(attempts) = self.attempts {
            updated.attempts = attempts;
        }
        if let Some(notes) = &self.notes {
            updated.notes = notes.clone();
        }
        updated.updated_at = now;
        Ok(updated)
    }
}
