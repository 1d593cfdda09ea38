//! Conflict resolution between a queued local mutation and diverged remote
//! state.

use super::item::{Operation, SyncQueueItem};
use super::remote::RemoteSnapshot;

/// Which side of a conflict survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Resend the local mutation against the remote's current version.
    KeepLocal,
    /// Stop delivering; the item fails with the remote snapshot attached.
    KeepRemote,
}

pub trait ConflictPolicy: Send + Sync {
    fn resolve(&self, local: &SyncQueueItem, remote: &RemoteSnapshot) -> Resolution;
}

/// Last write wins by timestamp: the local mutation survives only when it
/// was recorded strictly after the remote's last change.
///
/// A remote deletion always wins against a local update. A local delete
/// that meets a tombstone is settled as delivered before any policy runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictPolicy for LastWriteWins {
    fn resolve(&self, local: &SyncQueueItem, remote: &RemoteSnapshot) -> Resolution {
        if remote.deleted && local.operation != Operation::Create {
            return Resolution::KeepRemote;
        }
        if local.recorded_at > remote.updated_at {
            Resolution::KeepLocal
        } else {
            Resolution::KeepRemote
        }
    }
}

/// Every conflict goes to the user.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualReview;

impl ConflictPolicy for ManualReview {
    fn resolve(&self, _local: &SyncQueueItem, _remote: &RemoteSnapshot) -> Resolution {
        Resolution::KeepRemote
    }
}
