//! Grade normalization - parsing and ordering climbing grades.
//!
//! Every supported system has a fixed, hand-curated table of canonical
//! symbols ordered by difficulty. A grade's `sort_order` is its index in that
//! table, which makes it dense, unique within the system, and stable across
//! releases because tables only ever grow at the end.
//!
//! ## Example
//!
//! ```
//! use logbook_sync::grade::{self, GradeSystem};
//!
//! let grade = grade::parse("5.10a").unwrap();
//! assert_eq!(grade.system(), GradeSystem::Yds);
//! assert!(grade < grade::parse("5.10b").unwrap());
//! ```

mod tables;

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported grading systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeSystem {
    Yds,
    French,
    VScale,
    Uiaa,
}

/// Systems in the order `parse` tries them.
const PARSE_PRIORITY: [GradeSystem; 4] = [
    GradeSystem::Yds,
    GradeSystem::VScale,
    GradeSystem::French,
    GradeSystem::Uiaa,
];

impl GradeSystem {
    /// The canonical symbols of this system, easiest first.
    pub fn grades(self) -> &'static [&'static str] {
        match self {
            GradeSystem::Yds => tables::YDS,
            GradeSystem::French => tables::FRENCH,
            GradeSystem::VScale => tables::V_SCALE,
            GradeSystem::Uiaa => tables::UIAA,
        }
    }

    /// Whether `input` is shaped like a grade of this system.
    ///
    /// French grades carry no prefix, so they claim any input.
    fn claims(self, input: &str) -> bool {
        match self {
            GradeSystem::Yds => input.starts_with("5."),
            GradeSystem::VScale => input.starts_with(['V', 'v']),
            GradeSystem::French | GradeSystem::Uiaa => true,
        }
    }

    fn lookup(self, input: &str) -> Option<Grade> {
        self.grades()
            .iter()
            .position(|symbol| symbol.eq_ignore_ascii_case(input))
            .map(|index| Grade {
                value: self.grades()[index].to_string(),
                system: self,
                sort_order: index as u32,
            })
    }
}

impl fmt::Display for GradeSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GradeSystem::Yds => "YDS",
            GradeSystem::French => "French",
            GradeSystem::VScale => "V-Scale",
            GradeSystem::Uiaa => "UIAA",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GradeError {
    /// The input matches no supported system's table. This is a user input
    /// error, not a fault.
    #[error("grade not recognized: {0:?}")]
    NotRecognized(String),
    /// Two grades from different systems were compared.
    #[error("cannot compare {left} grade with {right} grade")]
    IncomparableGrades {
        left: GradeSystem,
        right: GradeSystem,
    },
}

/// A validated grade in canonical spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Grade {
    value: String,
    system: GradeSystem,
    sort_order: u32,
}

impl Grade {
    /// Build a grade from an already-known system, rejecting unknown symbols.
    pub fn new(system: GradeSystem, value: &str) -> Result<Self, GradeError> {
        parse_in(system, value)
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn system(&self) -> GradeSystem {
        self.system
    }

    pub fn sort_order(&self) -> u32 {
        self.sort_order
    }

    /// Total order within one system; fails across systems.
    pub fn compare(&self, other: &Grade) -> Result<Ordering, GradeError> {
        compare(self, other)
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl PartialOrd for Grade {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        compare(self, other).ok()
    }
}

/// Parse a grade string, trying YDS, then V-Scale, then French, then UIAA.
///
/// Matching is exact after ASCII case folding and whitespace trimming; the
/// first system whose table contains the symbol wins.
pub fn parse(input: &str) -> Result<Grade, GradeError> {
    let trimmed = input.trim();
    PARSE_PRIORITY
        .iter()
        .filter(|system| system.claims(trimmed))
        .find_map(|system| system.lookup(trimmed))
        .ok_or_else(|| GradeError::NotRecognized(input.to_string()))
}

/// Parse a grade string against a single system.
pub fn parse_in(system: GradeSystem, input: &str) -> Result<Grade, GradeError> {
    system
        .lookup(input.trim())
        .ok_or_else(|| GradeError::NotRecognized(input.to_string()))
}

pub fn compare(a: &Grade, b: &Grade) -> Result<Ordering, GradeError> {
    if a.system != b.system {
        return Err(GradeError::IncomparableGrades {
            left: a.system,
            right: b.system,
        });
    }
    Ok(a.sort_order.cmp(&b.sort_order))
}

/// Sort grades by system, then by difficulty within each system.
pub fn sort_grades(grades: &mut [Grade]) {
    grades.sort_by(|a, b| {
        a.system
            .cmp(&b.system)
            .then(a.sort_order.cmp(&b.sort_order))
    });
}
