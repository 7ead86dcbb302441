//! Job queue storage: the claim protocol and state machine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use catalogops_core::{Clock, SystemClock, WorkerId};

use super::types::{Job, JobId, JobStatus, NewJob, RetryPolicy, RunReport, RunSummary};

/// Queue settings shared by every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long a claim stays valid without renewal
    pub lease_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

/// Durable job queue.
///
/// Every call after `claim` is fenced by the claiming worker: once a lease has
/// been recovered and handed to someone else, the old owner gets
/// `JobQueueError::LeaseLost` instead of overwriting the new owner's state.
pub trait JobQueue: Send + Sync {
    /// Enqueue a new job in `queued`.
    fn enqueue(&self, job: NewJob) -> Result<JobId, JobQueueError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError>;

    /// Atomically lease the next visible queued job (priority desc, then oldest).
    /// Returns None if no jobs are available.
    fn claim(&self, worker: &WorkerId) -> Result<Option<Job>, JobQueueError>;

    /// `leased → running`, extending the lease.
    fn mark_running(&self, job_id: JobId, worker: &WorkerId) -> Result<Job, JobQueueError>;

    /// Extend the lease of a leased or running job.
    fn renew_lease(&self, job_id: JobId, worker: &WorkerId)
    -> Result<DateTime<Utc>, JobQueueError>;

    /// `running → succeeded`.
    fn complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        report: RunReport,
    ) -> Result<Job, JobQueueError>;

    /// Count a failed attempt: requeue with backoff, or dead-letter once the
    /// attempt budget is spent.
    fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        report: RunReport,
    ) -> Result<Job, JobQueueError>;

    /// Dead-letter immediately without consuming an attempt (the job can never succeed).
    fn dead_letter(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        report: RunReport,
    ) -> Result<Job, JobQueueError>;

    /// Requeue every leased/running job whose lease has expired. Attempts are
    /// preserved. Returns the recovered jobs in their new `queued` state.
    fn recover_expired(&self) -> Result<Vec<Job>, JobQueueError>;

    /// List jobs, oldest first.
    fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobQueueError>;

    /// Run summaries for a job, oldest first.
    fn run_summaries(&self, job_id: JobId) -> Result<Vec<RunSummary>, JobQueueError>;

    /// Count jobs per status.
    fn stats(&self) -> Result<JobStats, JobQueueError>;
}

/// Job queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobQueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} cannot {action} from status {status}")]
    InvalidTransition {
        job_id: JobId,
        status: JobStatus,
        action: &'static str,
    },
    #[error("job {job_id} is no longer leased by {worker}")]
    LeaseLost { job_id: JobId, worker: WorkerId },
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub leased: usize,
    pub running: usize,
    pub succeeded: usize,
    pub deadletter: usize,
}

impl JobStats {
    pub(crate) fn count(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub(crate) fn add(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::Queued => self.queued += n,
            JobStatus::Leased => self.leased += n,
            JobStatus::Running => self.running += n,
            JobStatus::Succeeded => self.succeeded += n,
            JobStatus::Deadletter => self.deadletter += n,
        }
    }
}

/// Fencing check shared by every backend: the worker must still hold the
/// lease and the job must be in one of the `allowed` statuses.
pub(crate) fn ensure_leased_by(
    job: &Job,
    worker: &WorkerId,
    action: &'static str,
    allowed: &[JobStatus],
) -> Result<(), JobQueueError> {
    let lease_lost = || JobQueueError::LeaseLost {
        job_id: job.id,
        worker: worker.clone(),
    };

    if job.status.holds_lease() && !job.is_leased_by(worker) {
        return Err(lease_lost());
    }
    if !allowed.contains(&job.status) {
        // A queued job was recovered by the watchdog while this worker was still busy.
        return Err(if job.status == JobStatus::Queued {
            lease_lost()
        } else {
            JobQueueError::InvalidTransition {
                job_id: job.id,
                status: job.status,
                action,
            }
        });
    }
    Ok(())
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// In-memory job queue for tests/dev.
///
/// A single write lock around the job map makes every read-check-write atomic,
/// which is what the durable backend gets from row locks.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    jobs: RwLock<HashMap<JobId, Job>>,
    runs: RwLock<Vec<RunSummary>>,
}

impl InMemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            jobs: RwLock::new(HashMap::new()),
            runs: RwLock::new(Vec::new()),
        }
    }

    pub fn arc(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn read_jobs(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobQueueError> {
        self.jobs
            .read()
            .map_err(|_| JobQueueError::Storage("job map lock poisoned".to_string()))
    }

    fn write_jobs(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobQueueError> {
        self.jobs
            .write()
            .map_err(|_| JobQueueError::Storage("job map lock poisoned".to_string()))
    }

    fn push_run(&self, summary: RunSummary) -> Result<(), JobQueueError> {
        self.runs
            .write()
            .map_err(|_| JobQueueError::Storage("run log lock poisoned".to_string()))?
            .push(summary);
        Ok(())
    }

    /// Apply `f` to a job the worker still holds a lease on.
    fn with_leased_job<F>(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        action: &'static str,
        allowed: &[JobStatus],
        f: F,
    ) -> Result<Job, JobQueueError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>),
    {
        let mut jobs = self.write_jobs()?;
        let job = jobs.get_mut(&job_id).ok_or(JobQueueError::NotFound(job_id))?;
        ensure_leased_by(job, worker, action, allowed)?;

        let now = self.clock.now();
        f(job, now);
        job.updated_at = now;
        Ok(job.clone())
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: NewJob) -> Result<JobId, JobQueueError> {
        let job = Job::from_new(job, self.clock.now());
        let mut jobs = self.write_jobs()?;
        if jobs.contains_key(&job.id) {
            return Err(JobQueueError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        Ok(self.read_jobs()?.get(&job_id).cloned())
    }

    fn claim(&self, worker: &WorkerId) -> Result<Option<Job>, JobQueueError> {
        let mut jobs = self.write_jobs()?;
        let now = self.clock.now();

        let next = jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        job.status = JobStatus::Leased;
        job.lease_owner = Some(worker.clone());
        job.lease_expires_at = Some(now + to_chrono(self.config.lease_ttl));
        job.not_before = None;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    fn mark_running(&self, job_id: JobId, worker: &WorkerId) -> Result<Job, JobQueueError> {
        let ttl = to_chrono(self.config.lease_ttl);
        self.with_leased_job(job_id, worker, "start", &[JobStatus::Leased], |job, now| {
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.lease_expires_at = Some(now + ttl);
        })
    }

    fn renew_lease(
        &self,
        job_id: JobId,
        worker: &WorkerId,
    ) -> Result<DateTime<Utc>, JobQueueError> {
        let ttl = to_chrono(self.config.lease_ttl);
        let job = self.with_leased_job(
            job_id,
            worker,
            "renew lease",
            &[JobStatus::Leased, JobStatus::Running],
            |job, now| job.lease_expires_at = Some(now + ttl),
        )?;
        job.lease_expires_at
            .ok_or_else(|| JobQueueError::Storage("renewed lease has no expiry".to_string()))
    }

    fn complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        report: RunReport,
    ) -> Result<Job, JobQueueError> {
        let job = self.with_leased_job(job_id, worker, "complete", &[JobStatus::Running], |job, _| {
            job.status = JobStatus::Succeeded;
            job.clear_lease();
            job.last_error = None;
        })?;
        self.push_run(RunSummary::for_job(
            &job,
            worker,
            job.attempts + 1,
            report,
            None,
            job.updated_at,
        ))?;
        Ok(job)
    }

    fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        report: RunReport,
    ) -> Result<Job, JobQueueError> {
        let retry = self.config.retry.clone();
        let job = self.with_leased_job(
            job_id,
            worker,
            "fail",
            &[JobStatus::Leased, JobStatus::Running],
            |job, now| {
                job.attempts += 1;
                job.clear_lease();
                job.last_error = Some(error.to_string());
                if retry.should_retry(job.attempts) {
                    job.status = JobStatus::Queued;
                    job.not_before = Some(now + to_chrono(retry.backoff(job.attempts)));
                } else {
                    job.status = JobStatus::Deadletter;
                    job.not_before = None;
                }
            },
        )?;
        self.push_run(RunSummary::for_job(
            &job,
            worker,
            job.attempts,
            report,
            Some(error.to_string()),
            job.updated_at,
        ))?;
        Ok(job)
    }

    fn dead_letter(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        report: RunReport,
    ) -> Result<Job, JobQueueError> {
        let job = self.with_leased_job(
            job_id,
            worker,
            "dead-letter",
            &[JobStatus::Leased, JobStatus::Running],
            |job, _| {
                job.status = JobStatus::Deadletter;
                job.clear_lease();
                job.not_before = None;
                job.last_error = Some(error.to_string());
            },
        )?;
        self.push_run(RunSummary::for_job(
            &job,
            worker,
            job.attempts + 1,
            report,
            Some(error.to_string()),
            job.updated_at,
        ))?;
        Ok(job)
    }

    fn recover_expired(&self) -> Result<Vec<Job>, JobQueueError> {
        let mut jobs = self.write_jobs()?;
        let now = self.clock.now();

        let mut recovered = Vec::new();
        for job in jobs.values_mut().filter(|j| j.lease_expired(now)) {
            let owner = job
                .lease_owner
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            job.status = JobStatus::Queued;
            job.clear_lease();
            job.not_before = None;
            job.last_error = Some(format!("lease expired while held by {owner}"));
            job.updated_at = now;
            recovered.push(job.clone());
        }

        recovered.sort_by_key(|j| j.created_at);
        Ok(recovered)
    }

    fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobQueueError> {
        let jobs = self.read_jobs()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    fn run_summaries(&self, job_id: JobId) -> Result<Vec<RunSummary>, JobQueueError> {
        let runs = self
            .runs
            .read()
            .map_err(|_| JobQueueError::Storage("run log lock poisoned".to_string()))?;
        Ok(runs.iter().filter(|r| r.job_id == job_id).cloned().collect())
    }

    fn stats(&self) -> Result<JobStats, JobQueueError> {
        let jobs = self.read_jobs()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.count(job.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobType;
    use catalogops_core::ManualClock;
    use std::collections::HashSet;
    use std::thread;

    fn worker(name: &str) -> WorkerId {
        WorkerId::from(name)
    }

    fn queue_with_clock(max_attempts: u32) -> (InMemoryJobQueue, ManualClock) {
        let clock = ManualClock::starting_now();
        let config = QueueConfig {
            lease_ttl: Duration::from_secs(60),
            retry: RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            },
        };
        (InMemoryJobQueue::with_clock(config, Arc::new(clock.clone())), clock)
    }

    fn audit_job() -> NewJob {
        NewJob::new(JobType::Audit, serde_json::json!({"family_id": "lamps"}))
    }

    #[test]
    fn enqueue_and_claim() {
        let (queue, _) = queue_with_clock(3);
        let job_id = queue.enqueue(audit_job()).unwrap();

        let claimed = queue.claim(&worker("w1")).unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.status, JobStatus::Leased);
        assert_eq!(claimed.lease_owner, Some(worker("w1")));
        assert!(claimed.lease_expires_at.is_some());

        // No more jobs
        assert!(queue.claim(&worker("w2")).unwrap().is_none());
    }

    #[test]
    fn claim_prefers_priority_then_age() {
        let (queue, clock) = queue_with_clock(3);
        let old = queue.enqueue(audit_job()).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let urgent = queue.enqueue(audit_job().with_priority(10)).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let newer = queue.enqueue(audit_job()).unwrap();

        let order: Vec<JobId> = (0..3)
            .map(|_| queue.claim(&worker("w")).unwrap().unwrap().id)
            .collect();
        assert_eq!(order, vec![urgent, old, newer]);
    }

    #[test]
    fn happy_path_records_a_run_summary() {
        let (queue, _) = queue_with_clock(3);
        let w = worker("w1");
        let job_id = queue.enqueue(audit_job()).unwrap();
        queue.claim(&w).unwrap().unwrap();

        let running = queue.mark_running(job_id, &w).unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        let report = RunReport {
            duration_ms: 12,
            operations_applied: 2,
        };
        let done = queue.complete(job_id, &w, report).unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert!(done.lease_owner.is_none() && done.lease_expires_at.is_none());

        let runs = queue.run_summaries(job_id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, JobStatus::Succeeded);
        assert_eq!(runs[0].operations_applied, 2);
    }

    #[test]
    fn complete_requires_running() {
        let (queue, _) = queue_with_clock(3);
        let w = worker("w1");
        let job_id = queue.enqueue(audit_job()).unwrap();
        queue.claim(&w).unwrap().unwrap();

        let err = queue.complete(job_id, &w, RunReport::default()).unwrap_err();
        assert!(matches!(err, JobQueueError::InvalidTransition { action: "complete", .. }));
    }

    #[test]
    fn failed_job_is_invisible_until_backoff_elapses() {
        let (queue, clock) = queue_with_clock(3);
        let w = worker("w1");
        let job_id = queue.enqueue(audit_job()).unwrap();
        queue.claim(&w).unwrap().unwrap();
        queue.mark_running(job_id, &w).unwrap();

        let failed = queue.fail(job_id, &w, "boom", RunReport::default()).unwrap();
        assert_eq!(failed.status, JobStatus::Queued);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
        let not_before = failed.not_before.unwrap();

        assert!(queue.claim(&w).unwrap().is_none());

        clock.set(not_before);
        let reclaimed = queue.claim(&w).unwrap().unwrap();
        assert_eq!(reclaimed.id, job_id);
        assert_eq!(reclaimed.attempts, 1);
    }

    #[test]
    fn attempts_exhausted_dead_letters() {
        let (queue, clock) = queue_with_clock(3);
        let w = worker("w1");
        let job_id = queue.enqueue(audit_job()).unwrap();

        for _ in 0..3 {
            clock.advance(chrono::Duration::hours(2));
            queue.claim(&w).unwrap().unwrap();
            queue.mark_running(job_id, &w).unwrap();
            queue.fail(job_id, &w, "always", RunReport::default()).unwrap();
        }

        let job = queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Deadletter);
        assert_eq!(job.attempts, 3);
        assert_eq!(queue.run_summaries(job_id).unwrap().len(), 3);

        clock.advance(chrono::Duration::hours(2));
        assert!(queue.claim(&w).unwrap().is_none());
    }

    #[test]
    fn dead_letter_does_not_consume_attempts() {
        let (queue, _) = queue_with_clock(3);
        let w = worker("w1");
        let job_id = queue.enqueue(audit_job()).unwrap();
        queue.claim(&w).unwrap().unwrap();
        queue.mark_running(job_id, &w).unwrap();

        let job = queue
            .dead_letter(job_id, &w, "validation failed", RunReport::default())
            .unwrap();
        assert_eq!(job.status, JobStatus::Deadletter);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.last_error.as_deref(), Some("validation failed"));
    }

    #[test]
    fn other_workers_cannot_touch_a_lease() {
        let (queue, _) = queue_with_clock(3);
        let job_id = queue.enqueue(audit_job()).unwrap();
        queue.claim(&worker("w1")).unwrap().unwrap();

        let err = queue.mark_running(job_id, &worker("w2")).unwrap_err();
        assert!(matches!(err, JobQueueError::LeaseLost { .. }));
    }

    #[test]
    fn recover_expired_requeues_and_fences_the_old_owner() {
        let (queue, clock) = queue_with_clock(3);
        let w = worker("w1");
        let stuck = queue.enqueue(audit_job()).unwrap();
        queue.claim(&w).unwrap().unwrap();
        queue.mark_running(stuck, &w).unwrap();

        clock.advance(chrono::Duration::seconds(30));
        let fresh = queue.enqueue(audit_job()).unwrap();
        queue.claim(&worker("w2")).unwrap().unwrap();
        queue.mark_running(fresh, &worker("w2")).unwrap();

        clock.advance(chrono::Duration::seconds(31));
        let recovered = queue.recover_expired().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, stuck);
        assert_eq!(recovered[0].status, JobStatus::Queued);
        assert_eq!(recovered[0].attempts, 0);
        assert!(recovered[0].lease_owner.is_none());

        assert_eq!(queue.get(fresh).unwrap().unwrap().status, JobStatus::Running);

        let err = queue.complete(stuck, &w, RunReport::default()).unwrap_err();
        assert!(matches!(err, JobQueueError::LeaseLost { .. }));
    }

    #[test]
    fn renewing_keeps_a_lease_alive() {
        let (queue, clock) = queue_with_clock(3);
        let w = worker("w1");
        let job_id = queue.enqueue(audit_job()).unwrap();
        queue.claim(&w).unwrap().unwrap();
        queue.mark_running(job_id, &w).unwrap();

        clock.advance(chrono::Duration::seconds(50));
        queue.renew_lease(job_id, &w).unwrap();
        clock.advance(chrono::Duration::seconds(50));

        assert!(queue.recover_expired().unwrap().is_empty());
    }

    #[test]
    fn concurrent_claims_never_share_a_job() {
        let queue = Arc::new(InMemoryJobQueue::new(QueueConfig::default()));
        for _ in 0..50 {
            queue.enqueue(audit_job()).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let me = WorkerId::from(format!("w{i}").as_str());
                    let mut mine = Vec::new();
                    while let Some(job) = queue.claim(&me).unwrap() {
                        mine.push(job.id);
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            for id in h.join().unwrap() {
                total += 1;
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(total, 50);
    }

    #[test]
    fn stats_tracking() {
        let (queue, _) = queue_with_clock(3);
        for _ in 0..5 {
            queue.enqueue(audit_job()).unwrap();
        }

        let stats = queue.stats().unwrap();
        assert_eq!(stats.queued, 5);

        queue.claim(&worker("a")).unwrap();
        queue.claim(&worker("b")).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.leased, 2);
    }
}
