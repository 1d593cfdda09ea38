//! Background thread that keeps draining the sync queue.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use crate::store::LocalStore;

use super::remote::RemoteAuthority;
use super::worker::SyncWorker;

/// Totals accumulated by a [`SyncWorkerThread`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub polls: usize,
    pub recovered: usize,
    pub acknowledged: usize,
    pub rescheduled: usize,
    pub rebased: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub errors: usize,
}

/// Owns a [`SyncWorker`] on its own thread.
///
/// On start the thread returns items left InFlight by an earlier run to
/// Pending, then drains the queue every `poll_interval` until stopped. A
/// failed drain is followed by the same recovery.
///
/// ## Example
///
/// ```ignore
/// let thread = SyncWorkerThread::spawn(worker, Duration::from_millis(50));
/// // ... log climbs ...
/// let stats = thread.stop();
/// println!("acknowledged {}", stats.acknowledged);
/// ```
pub struct SyncWorkerThread {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<WorkerStats>>,
}

impl SyncWorkerThread {
    pub fn spawn<S, R>(worker: SyncWorker<S, R>, poll_interval: Duration) -> Self
    where
        S: LocalStore + 'static,
        R: RemoteAuthority + 'static,
    {
        let (stop_tx, stop_rx) = channel();

        let handle = thread::spawn(move || {
            let mut stats = WorkerStats::default();
            match worker.queue().recover_in_flight() {
                Ok(recovered) => stats.recovered = recovered,
                Err(error) => {
                    warn!(%error, "could not recover interrupted sync items");
                    stats.errors += 1;
                }
            }

            loop {
                stats.polls += 1;
                match worker.drain() {
                    Ok(result) => {
                        stats.acknowledged += result.acknowledged;
                        stats.rescheduled += result.rescheduled;
                        stats.rebased += result.rebased;
                        stats.failed += result.failed;
                        stats.cancelled += result.cancelled;
                    }
                    Err(error) => {
                        warn!(%error, "sync drain failed");
                        stats.errors += 1;
                        // This thread is the only consumer; nothing can be legitimately InFlight here.
                        if let Ok(recovered) = worker.queue().recover_in_flight() {
                            stats.recovered += recovered;
                        }
                    }
                }

                match stop_rx.recv_timeout(poll_interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }

            info!(?stats, "sync worker stopped");
            stats
        });

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signal the worker to stop and wait for it to finish.
    pub fn stop(mut self) -> WorkerStats {
        let _ = self.stop_tx.send(());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => WorkerStats::default(),
        }
    }

    /// Signal the worker to stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

impl Drop for SyncWorkerThread {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
