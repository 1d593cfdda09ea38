//! InMemoryStore - HashMap-backed local store for testing and development.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::model::{Climb, Model, Session, Versioned};
use crate::sync::SyncQueueItem;

use super::{LocalCommit, LocalStore, QueueTable, StoreError, WriteOp};

/// Internal stored representation of a model.
#[derive(Clone)]
struct StoredModel {
    bytes: Vec<u8>,
    version: u64,
}

/// In-memory store backed by a HashMap of JSON rows and a queue table.
///
/// Row key is `"COLLECTION:id"`. Clone-friendly via Arc: clones are handles
/// to the same storage.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    records: Arc<RwLock<HashMap<String, StoredModel>>>,
    queue: Arc<RwLock<QueueTable>>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn make_key(collection: &str, id: &str) -> String {
        format!("{}:{}", collection, id)
    }

    fn decode<M: Model>(stored: &StoredModel) -> Result<Versioned<M>, StoreError> {
        Ok(Versioned {
            data: serde_json::from_slice(&stored.bytes)?,
            version: stored.version,
        })
    }

    fn climbs_of(
        records: &HashMap<String, StoredModel>,
        session_id: &str,
    ) -> Result<Vec<Climb>, StoreError> {
        let prefix = format!("{}:", Climb::COLLECTION);
        let mut climbs = Vec::new();
        for (key, stored) in records.iter() {
            if !key.starts_with(&prefix) {
                continue;
            }
            let climb: Climb = serde_json::from_slice(&stored.bytes)?;
            if climb.session_id == session_id {
                climbs.push(climb);
            }
        }
        climbs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(climbs)
    }
}

/// Row state visible to a commit: staged writes shadow stored rows.
fn current<'a>(
    records: &'a HashMap<String, StoredModel>,
    staged: &'a HashMap<String, Option<StoredModel>>,
    key: &str,
) -> Option<&'a StoredModel> {
    match staged.get(key) {
        Some(entry) => entry.as_ref(),
        None => records.get(key),
    }
}

fn check_version(
    collection: &str,
    id: &str,
    expected: Option<u64>,
    actual: u64,
) -> Result<(), StoreError> {
    match expected {
        Some(expected) if expected != actual => Err(StoreError::ConcurrentWrite {
            collection: collection.to_string(),
            id: id.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

impl LocalStore for InMemoryStore {
    fn get<M: Model>(&self, id: &str) -> Result<Option<Versioned<M>>, StoreError> {
        let key = Self::make_key(M::COLLECTION, id);
        let records = self
            .records
            .read()
            .map_err(|_| StoreError::LockPoisoned("read"))?;

        records.get(&key).map(Self::decode::<M>).transpose()
    }

    fn find<M: Model>(
        &self,
        predicate: &dyn Fn(&M) -> bool,
    ) -> Result<Vec<Versioned<M>>, StoreError> {
        let prefix = format!("{}:", M::COLLECTION);
        let records = self
            .records
            .read()
            .map_err(|_| StoreError::LockPoisoned("find"))?;

        let mut results = Vec::new();
        for (key, stored) in records.iter() {
            if !key.starts_with(&prefix) {
                continue;
            }
            let versioned: Versioned<M> = Self::decode(stored)?;
            if predicate(&versioned.data) {
                results.push(versioned);
            }
        }
        Ok(results)
    }

    fn commit(&self, commit: LocalCommit) -> Result<Vec<SyncQueueItem>, StoreError> {
        // Lock order: records, then queue.
        let mut records = self
            .records
            .write()
            .map_err(|_| StoreError::LockPoisoned("commit"))?;
        let mut queue = self
            .queue
            .write()
            .map_err(|_| StoreError::LockPoisoned("commit queue"))?;

        let mut staged: HashMap<String, Option<StoredModel>> = HashMap::new();
        let mut appended = Vec::new();

        for op in commit.into_ops() {
            match op {
                WriteOp::Put {
                    collection,
                    id,
                    bytes,
                    expected_version,
                } => {
                    let key = Self::make_key(collection, &id);
                    let actual = current(&records, &staged, &key).map_or(0, |m| m.version);
                    check_version(collection, &id, expected_version, actual)?;
                    staged.insert(
                        key,
                        Some(StoredModel {
                            bytes,
                            version: actual + 1,
                        }),
                    );
                }
                WriteOp::Delete {
                    collection,
                    id,
                    expected_version,
                } => {
                    let key = Self::make_key(collection, &id);
                    let actual = current(&records, &staged, &key)
                        .map(|m| m.version)
                        .ok_or_else(|| StoreError::NotFound {
                            collection: collection.to_string(),
                            id: id.clone(),
                        })?;
                    check_version(collection, &id, expected_version, actual)?;
                    staged.insert(key, None);
                }
                WriteOp::AdjustCounters { session_id, delta } => {
                    let key = Self::make_key(Session::COLLECTION, &session_id);
                    let stored = current(&records, &staged, &key).ok_or_else(|| {
                        StoreError::NotFound {
                            collection: Session::COLLECTION.to_string(),
                            id: session_id.clone(),
                        }
                    })?;
                    let version = stored.version;
                    let mut session: Session = serde_json::from_slice(&stored.bytes)?;
                    if !session.is_active() {
                        return Err(StoreError::SessionClosed(session_id));
                    }
                    if delta.apply_to(&mut session) {
                        warn!(
                            session_id = %session_id,
                            climbs = delta.climbs,
                            completed = delta.completed,
                            "counter adjustment clamped; cached counters had drifted"
                        );
                    }
                    staged.insert(
                        key,
                        Some(StoredModel {
                            bytes: serde_json::to_vec(&session)?,
                            version: version + 1,
                        }),
                    );
                }
                WriteOp::Enqueue(item) => appended.push(item),
            }
        }

        for (key, entry) in staged {
            match entry {
                Some(stored) => {
                    records.insert(key, stored);
                }
                None => {
                    records.remove(&key);
                }
            }
        }

        Ok(appended
            .into_iter()
            .map(|item| queue.append(item))
            .collect())
    }

    fn update_session_with_climbs<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session, &[Climb]) -> T,
    ) -> Result<Option<T>, StoreError> {
        let key = Self::make_key(Session::COLLECTION, session_id);
        let mut records = self
            .records
            .write()
            .map_err(|_| StoreError::LockPoisoned("update session"))?;

        let Some(stored) = records.get(&key) else {
            return Ok(None);
        };
        let version = stored.version;
        let original: Session = serde_json::from_slice(&stored.bytes)?;
        let climbs = Self::climbs_of(&records, session_id)?;

        let mut session = original.clone();
        let result = f(&mut session, &climbs);
        if session != original {
            records.insert(
                key,
                StoredModel {
                    bytes: serde_json::to_vec(&session)?,
                    version: version + 1,
                },
            );
        }
        Ok(Some(result))
    }

    fn with_queue<T>(&self, f: impl FnOnce(&mut QueueTable) -> T) -> Result<T, StoreError> {
        let mut queue = self
            .queue
            .write()
            .map_err(|_| StoreError::LockPoisoned("queue"))?;
        Ok(f(&mut queue))
    }
}
