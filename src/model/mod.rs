//! Models - the locally stored logbook entities.
//!
//! Models are plain serde structs persisted by a [`LocalStore`] under a
//! collection name. Each stored row carries a local version used for
//! optimistic concurrency control.
//!
//! [`LocalStore`]: crate::store::LocalStore

mod climb;
mod session;

use serde::{de::DeserializeOwned, Serialize};

pub use climb::{Climb, ClimbResult, ClimbStyle, ClimbUpdate, NewClimb};
pub use session::Session;

/// Trait for types that can be stored as models.
pub trait Model: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// The collection name for this model type (e.g. "sessions", "climbs").
    const COLLECTION: &'static str;

    /// Returns the unique identifier for this model instance.
    fn id(&self) -> &str;
}

/// A model together with the local row version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub data: T,
    pub version: u64,
}

impl<T> Versioned<T> {
    pub fn into_inner(self) -> T {
        self.data
    }
}
