//! Watchdog: requeues jobs whose lease expired and frees their locks.
//!
//! A worker that dies mid-job leaves its job `leased`/`running` and its
//! resource locks held. Once the lease has expired the sweep puts the job back
//! in `queued` (attempts untouched) and force-releases the locks taken by the
//! job's earlier attempts. Only rows whose owner carries the job's prefix and
//! that were acquired before the recovery are removed, so a lock retaken by
//! another job, or by the attempt that claimed the job after recovery, stays.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use catalogops_core::{Clock, JobId, SystemClock};

use super::WorkerHandle;
use crate::apply::{JournalError, JournalStore};
use crate::jobs::{JobPayload, JobQueue, JobQueueError};
use crate::locks::{LockManager, job_owner_prefix};

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    /// Jobs moved back to `queued`
    pub requeued: Vec<JobId>,
    pub locks_released: usize,
    pub idempotency_purged: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchdogError {
    #[error(transparent)]
    Queue(#[from] JobQueueError),
    #[error(transparent)]
    Journal(#[from] JournalError),
}

pub struct Watchdog {
    queue: Arc<dyn JobQueue>,
    locks: Arc<dyn LockManager>,
    journal: Arc<dyn JournalStore>,
    clock: Arc<dyn Clock>,
    idempotency_retention: Option<Duration>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("idempotency_retention", &self.idempotency_retention)
            .finish_non_exhaustive()
    }
}

impl Watchdog {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        locks: Arc<dyn LockManager>,
        journal: Arc<dyn JournalStore>,
    ) -> Self {
        Self {
            queue,
            locks,
            journal,
            clock: Arc::new(SystemClock),
            idempotency_retention: None,
        }
    }

    /// Clock used for the idempotency retention cutoff.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Purge idempotency records older than `retention` on every sweep.
    pub fn with_idempotency_retention(mut self, retention: Option<Duration>) -> Self {
        self.idempotency_retention = retention;
        self
    }

    pub fn sweep(&self) -> Result<SweepReport, WatchdogError> {
        let recovered = self.queue.recover_expired()?;
        let mut report = SweepReport::default();

        for job in &recovered {
            report.requeued.push(job.id);
            let owner_prefix = job_owner_prefix(job.id);

            let payload = match JobPayload::decode(job.job_type, &job.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    // Undecodable jobs never got past the claim, so they hold no locks.
                    warn!(job_id = %job.id, error = %e, "recovered job has an undecodable payload");
                    continue;
                }
            };

            for key in payload.resource_keys() {
                match self.locks.force_release_stale(&key, &owner_prefix, job.updated_at) {
                    Ok(true) => report.locks_released += 1,
                    Ok(false) => {}
                    Err(e) => {
                        error!(job_id = %job.id, resource_key = %key, error = %e, "failed to release orphaned lock");
                    }
                }
            }
        }

        if let Some(retention) = self.idempotency_retention {
            let cutoff = self.clock.now() - crate::jobs::store::to_chrono(retention);
            report.idempotency_purged = self.journal.purge_idempotency_before(cutoff)?;
        }

        if report.requeued.is_empty() && report.idempotency_purged == 0 {
            debug!("watchdog sweep found nothing to do");
        } else {
            info!(
                requeued = report.requeued.len(),
                locks_released = report.locks_released,
                idempotency_purged = report.idempotency_purged,
                "watchdog sweep finished"
            );
        }
        Ok(report)
    }

    /// Run `sweep` every `interval` on a named thread.
    pub fn spawn(self, interval: Duration) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("catalogops-watchdog".to_string())
            .spawn(move || watchdog_loop(self, interval, shutdown_rx))?;

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

fn watchdog_loop(watchdog: Watchdog, interval: Duration, shutdown_rx: mpsc::Receiver<()>) {
    info!(interval_secs = interval.as_secs(), "watchdog started");

    loop {
        if let Err(e) = watchdog.sweep() {
            error!(error = %e, "watchdog sweep failed");
        }

        match shutdown_rx.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }

    info!("watchdog stopped");
}
