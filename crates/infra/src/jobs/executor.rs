//! Job executor: claim, lock, dispatch, apply, record.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use catalogops_core::WorkerId;

use super::handlers::{HandlerContext, HandlerRegistry, JobHandler};
use super::payload::JobPayload;
use super::store::{JobQueue, JobQueueError};
use super::types::{Job, JobId, JobStatus, RetryPolicy, RunReport};
use crate::apply::{ApplyEngine, ApplyMode, ApplyResult};
use crate::locks::{LockError, LockGuard, LockManager, attempt_owner};

/// Job executor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// How long to idle when the queue is empty (jittered)
    pub poll_interval: Duration,
    /// TTL of the resource locks a job holds
    pub lock_ttl: Duration,
    /// Local retries while a resource lock is busy
    pub lock_retry: RetryPolicy,
    /// Global kill switch; when false every job runs as a dry run
    pub apply_enabled: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            lock_ttl: Duration::from_secs(600),
            lock_retry: RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
                jitter: Duration::from_millis(200),
            },
            apply_enabled: false,
        }
    }
}

impl ExecutorConfig {
    pub fn with_apply_enabled(mut self, enabled: bool) -> Self {
        self.apply_enabled = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_lock_retry(mut self, retry: RetryPolicy) -> Self {
        self.lock_retry = retry;
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    worker_id: WorkerId,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Request graceful shutdown and wait for the in-flight job to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Failed attempts, including the ones that dead-lettered the job
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    /// Jobs dropped mid-run because their lease was recovered
    pub jobs_abandoned: u64,
    pub lock_busy_retries: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { operations: usize },
    /// Failed attempt; the job is back in `queued` behind its backoff
    Retrying { attempts: u32 },
    DeadLettered,
    /// The lease was recovered while this worker held it
    LeaseLost,
}

/// Executor error. Only queue storage failures escape `execute_one`; job
/// failures are recorded on the job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Queue(#[from] JobQueueError),
}

/// Why a dispatched job stopped early.
#[derive(Debug)]
enum DispatchError {
    /// Never succeeds on retry (validation, rejected payload)
    Permanent(String),
    Transient { error: String, operations: usize },
    LeaseLost,
    Queue(JobQueueError),
}

/// Background job executor.
///
/// Claims jobs from a queue, takes the resource locks their payload names,
/// asks the registered handler for change plans and runs every plan through
/// the apply engine.
pub struct JobExecutor {
    queue: Arc<dyn JobQueue>,
    locks: Arc<dyn LockManager>,
    engine: Arc<ApplyEngine>,
    handlers: Arc<HandlerRegistry>,
    config: ExecutorConfig,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("handlers", &self.handlers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobExecutor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        locks: Arc<dyn LockManager>,
        engine: Arc<ApplyEngine>,
        handlers: Arc<HandlerRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            queue,
            locks,
            engine,
            handlers,
            config,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut ExecutorStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|p| p.into_inner()));
    }

    /// Dry run when the kill switch is off or the producer asked for one.
    pub fn effective_mode(&self, job: &Job) -> ApplyMode {
        if self.config.apply_enabled && !job.dry_run {
            ApplyMode::Apply
        } else {
            ApplyMode::DryRun
        }
    }

    /// Spawn the worker loop on a named thread.
    pub fn spawn(self, worker_id: WorkerId) -> std::io::Result<JobExecutorHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();
        let worker = worker_id.clone();

        let join = thread::Builder::new()
            .name(worker_id.to_string())
            .spawn(move || executor_loop(self, worker, shutdown_rx))?;

        Ok(JobExecutorHandle {
            worker_id,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    /// Run one claim/dispatch cycle. Returns `None` when nothing was claimable.
    pub fn execute_one(
        &self,
        worker: &WorkerId,
    ) -> Result<Option<(JobId, JobOutcome)>, ExecutorError> {
        let Some(job) = self.queue.claim(worker)? else {
            return Ok(None);
        };
        debug!(worker = %worker, job_id = %job.id, job_type = %job.job_type, "claimed job");

        self.update_stats(|s| s.current_running += 1);
        let result = self.run_claimed(&job, worker, Instant::now());

        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match &result {
                Ok(JobOutcome::Succeeded { .. }) => s.jobs_succeeded += 1,
                Ok(JobOutcome::Retrying { .. }) => s.jobs_failed += 1,
                Ok(JobOutcome::DeadLettered) => {
                    s.jobs_failed += 1;
                    s.jobs_dead_lettered += 1;
                }
                Ok(JobOutcome::LeaseLost) => s.jobs_abandoned += 1,
                Err(_) => {}
            }
        });

        result.map(|outcome| Some((job.id, outcome)))
    }

    fn run_claimed(
        &self,
        job: &Job,
        worker: &WorkerId,
        started: Instant,
    ) -> Result<JobOutcome, ExecutorError> {
        let payload = match JobPayload::decode(job.job_type, &job.payload) {
            Ok(payload) => payload,
            Err(e) => {
                return self.dead_letter(job, worker, &format!("undecodable payload: {e}"), started, 0);
            }
        };
        let Some(handler) = self.handlers.get(job.job_type) else {
            let error = format!("no handler registered for {}", job.job_type);
            return self.dead_letter(job, worker, &error, started, 0);
        };

        let guard = match self.acquire_locks(job, worker, &payload) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "could not lock job resources");
                return self.fail(job, worker, &e.to_string(), started, 0);
            }
        };

        match self.queue.mark_running(job.id, worker) {
            Ok(_) => {}
            Err(JobQueueError::LeaseLost { .. }) => {
                self.release_locks(job, guard, true);
                return Ok(self.lease_lost(job, worker));
            }
            Err(e) => return Err(e.into()),
        }

        let mode = self.effective_mode(job);
        let dispatched = panic::catch_unwind(AssertUnwindSafe(|| {
            self.dispatch(job, worker, &payload, handler.as_ref(), mode, &guard)
        }));

        let outcome = match dispatched {
            Ok(Ok(operations)) => self.complete(job, worker, started, operations),
            Ok(Err(DispatchError::Permanent(error))) => {
                self.dead_letter(job, worker, &error, started, 0)
            }
            Ok(Err(DispatchError::Transient { error, operations })) => {
                self.fail(job, worker, &error, started, operations)
            }
            Ok(Err(DispatchError::LeaseLost)) => Ok(JobOutcome::LeaseLost),
            Ok(Err(DispatchError::Queue(e))) => Err(e.into()),
            Err(panic) => {
                let error = format!("handler panicked: {}", panic_message(panic.as_ref()));
                error!(job_id = %job.id, worker = %worker, error = %error, "job handler panicked");
                self.fail(job, worker, &error, started, 0)
            }
        };

        let lease_lost = matches!(outcome, Ok(JobOutcome::LeaseLost));
        self.release_locks(job, guard, lease_lost);
        if lease_lost {
            return Ok(self.lease_lost(job, worker));
        }
        outcome
    }

    /// Owner-scoped release. After a lost lease the watchdog may already have
    /// cleared the locks, and any lock a later attempt holds has another owner.
    fn release_locks(&self, job: &Job, guard: LockGuard, lease_lost: bool) {
        match guard.release() {
            Ok(()) => {}
            Err(LockError::NotOwner { resource_key, .. }) if lease_lost => {
                debug!(job_id = %job.id, resource_key = %resource_key, "lock already cleared after lease loss");
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "failed to release resource locks"),
        }
    }

    /// Take every lock the payload names, retrying locally while busy.
    fn acquire_locks(
        &self,
        job: &Job,
        worker: &WorkerId,
        payload: &JobPayload,
    ) -> Result<LockGuard, LockError> {
        let keys = payload.resource_keys();
        let owner = attempt_owner(job.id, worker);
        let retry = &self.config.lock_retry;

        let mut retries = 0;
        loop {
            match LockGuard::acquire_all(self.locks.clone(), &keys, &owner, self.config.lock_ttl) {
                Ok(guard) => return Ok(guard),
                Err(e) if e.is_busy() && retry.should_retry(retries) => {
                    let wait = retry.backoff(retries);
                    retries += 1;
                    self.update_stats(|s| s.lock_busy_retries += 1);
                    debug!(
                        job_id = %job.id,
                        error = %e,
                        retry = retries,
                        wait_ms = wait.as_millis() as u64,
                        "resource busy, waiting"
                    );
                    thread::sleep(wait);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(
        &self,
        job: &Job,
        worker: &WorkerId,
        payload: &JobPayload,
        handler: &dyn JobHandler,
        mode: ApplyMode,
        guard: &LockGuard,
    ) -> Result<usize, DispatchError> {
        let ctx = HandlerContext {
            job,
            payload,
            mode,
            catalog: self.engine.catalog(),
        };
        let plans = handler.plan(&ctx).map_err(|e| {
            if e.is_permanent() {
                DispatchError::Permanent(e.to_string())
            } else {
                DispatchError::Transient {
                    error: e.to_string(),
                    operations: 0,
                }
            }
        })?;

        let mut operations = 0;
        for plan in &plans {
            self.heartbeat(job, worker, guard, operations)?;

            match self.engine.apply(plan, mode) {
                Ok(ApplyResult::ValidationFailed { reasons }) => {
                    return Err(DispatchError::Permanent(format!(
                        "validation failed: {}",
                        reasons.join("; ")
                    )));
                }
                Ok(result) => {
                    operations += result.operations_applied();
                    debug!(job_id = %job.id, mode = %mode, result = ?result, "plan processed");
                }
                Err(e) => {
                    return Err(DispatchError::Transient {
                        error: e.to_string(),
                        operations,
                    });
                }
            }
        }
        Ok(operations)
    }

    /// Extend the job lease and the resource locks before the next plan.
    fn heartbeat(
        &self,
        job: &Job,
        worker: &WorkerId,
        guard: &LockGuard,
        operations: usize,
    ) -> Result<(), DispatchError> {
        match self.queue.renew_lease(job.id, worker) {
            Ok(_) => {}
            Err(JobQueueError::LeaseLost { .. }) => return Err(DispatchError::LeaseLost),
            Err(e) => return Err(DispatchError::Queue(e)),
        }
        guard.renew().map_err(|e| DispatchError::Transient {
            error: format!("lost resource lock: {e}"),
            operations,
        })
    }

    fn complete(
        &self,
        job: &Job,
        worker: &WorkerId,
        started: Instant,
        operations: usize,
    ) -> Result<JobOutcome, ExecutorError> {
        match self.queue.complete(job.id, worker, report(started, operations)) {
            Ok(_) => {
                info!(job_id = %job.id, job_type = %job.job_type, operations, "job succeeded");
                Ok(JobOutcome::Succeeded { operations })
            }
            Err(JobQueueError::LeaseLost { .. }) => Ok(JobOutcome::LeaseLost),
            Err(e) => Err(e.into()),
        }
    }

    fn fail(
        &self,
        job: &Job,
        worker: &WorkerId,
        error: &str,
        started: Instant,
        operations: usize,
    ) -> Result<JobOutcome, ExecutorError> {
        match self.queue.fail(job.id, worker, error, report(started, operations)) {
            Ok(updated) if updated.status == JobStatus::Deadletter => {
                warn!(job_id = %job.id, attempts = updated.attempts, error = %error, "job dead-lettered after exhausting attempts");
                Ok(JobOutcome::DeadLettered)
            }
            Ok(updated) => {
                info!(
                    job_id = %job.id,
                    attempts = updated.attempts,
                    not_before = ?updated.not_before,
                    error = %error,
                    "job failed, will retry"
                );
                Ok(JobOutcome::Retrying {
                    attempts: updated.attempts,
                })
            }
            Err(JobQueueError::LeaseLost { .. }) => Ok(JobOutcome::LeaseLost),
            Err(e) => Err(e.into()),
        }
    }

    fn dead_letter(
        &self,
        job: &Job,
        worker: &WorkerId,
        error: &str,
        started: Instant,
        operations: usize,
    ) -> Result<JobOutcome, ExecutorError> {
        match self
            .queue
            .dead_letter(job.id, worker, error, report(started, operations))
        {
            Ok(_) => {
                warn!(job_id = %job.id, error = %error, "job dead-lettered");
                Ok(JobOutcome::DeadLettered)
            }
            Err(JobQueueError::LeaseLost { .. }) => Ok(JobOutcome::LeaseLost),
            Err(e) => Err(e.into()),
        }
    }

    fn lease_lost(&self, job: &Job, worker: &WorkerId) -> JobOutcome {
        warn!(job_id = %job.id, worker = %worker, "lease lost mid-run; giving up the job");
        JobOutcome::LeaseLost
    }
}

fn report(started: Instant, operations: usize) -> RunReport {
    RunReport {
        duration_ms: started.elapsed().as_millis() as u64,
        operations_applied: operations as u32,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Idle wait: the poll interval plus up to half of it again.
fn jittered(poll_interval: Duration) -> Duration {
    let spread = (poll_interval.as_millis() / 2) as u64;
    if spread == 0 {
        return poll_interval;
    }
    poll_interval + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

fn executor_loop(executor: JobExecutor, worker: WorkerId, shutdown_rx: mpsc::Receiver<()>) {
    info!(worker = %worker, "job executor started");
    let start_time = Instant::now();

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        executor.update_stats(|s| s.uptime_secs = start_time.elapsed().as_secs());

        let idle = match executor.execute_one(&worker) {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                error!(worker = %worker, error = %e, "job queue error");
                true
            }
        };

        if idle {
            match shutdown_rx.recv_timeout(jittered(executor.config.poll_interval)) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }
    }

    info!(worker = %worker, "job executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{InMemoryJournal, JournalStore, RuleValidator, ValidationOutcome};
    use crate::catalog::{CatalogEntity, CatalogReader, InMemoryCatalogStore};
    use crate::jobs::handlers::HandlerError;
    use crate::jobs::payload::TargetedFixPayload;
    use crate::jobs::store::{InMemoryJobQueue, QueueConfig};
    use crate::jobs::types::{JobType, NewJob};
    use crate::jobs::payload::MergePayload;
    use crate::locks::{InMemoryLockManager, Lock};
    use crate::workers::Watchdog;
    use catalogops_core::{EntityId, FamilyId, ManualClock};
    use chrono::{DateTime, Utc};
    use serde_json::{Value, json};

    struct Fixture {
        queue: Arc<InMemoryJobQueue>,
        locks: Arc<InMemoryLockManager>,
        journal: Arc<InMemoryJournal>,
        catalog: Arc<InMemoryCatalogStore>,
        engine: Arc<ApplyEngine>,
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(InMemoryJobQueue::new(QueueConfig {
            lease_ttl: Duration::from_secs(60),
            retry: RetryPolicy::immediate(3),
        }));
        let locks = Arc::new(InMemoryLockManager::new());
        let journal = Arc::new(InMemoryJournal::new());
        let catalog = Arc::new(InMemoryCatalogStore::new());
        let engine = Arc::new(ApplyEngine::new(
            journal.clone(),
            catalog.clone(),
            Arc::new(RuleValidator::new()),
        ));

        let Value::Object(attrs) = json!({"color": "red"}) else {
            unreachable!()
        };
        catalog.insert(CatalogEntity::new(EntityId::from("a"), FamilyId::from("sofas"), attrs));

        Fixture {
            queue,
            locks,
            journal,
            catalog,
            engine,
        }
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig::default()
            .with_apply_enabled(true)
            .with_poll_interval(Duration::from_millis(5))
            .with_lock_retry(RetryPolicy::immediate(2))
    }

    fn executor(f: &Fixture, registry: HandlerRegistry, config: ExecutorConfig) -> JobExecutor {
        JobExecutor::new(
            f.queue.clone(),
            f.locks.clone(),
            f.engine.clone(),
            Arc::new(registry),
            config,
        )
    }

    fn fix_color(color: &str) -> NewJob {
        let Value::Object(fields) = json!({ "color": color }) else {
            unreachable!()
        };
        let payload = JobPayload::TargetedFix(TargetedFixPayload {
            family_id: FamilyId::from("sofas"),
            entity_id: EntityId::from("a"),
            fields,
        });
        NewJob::new(JobType::TargetedFix, payload.to_value())
    }

    fn color(f: &Fixture) -> Value {
        f.catalog.get(&EntityId::from("a")).unwrap().unwrap().attributes["color"].clone()
    }

    fn worker() -> WorkerId {
        WorkerId::from("worker-1")
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let f = fixture();
        let exec = executor(&f, HandlerRegistry::catalog_defaults(), config());
        assert_eq!(exec.execute_one(&worker()).unwrap(), None);
    }

    #[test]
    fn applies_plan_and_releases_locks() {
        let f = fixture();
        let exec = executor(&f, HandlerRegistry::catalog_defaults(), config());
        let job_id = f.queue.enqueue(fix_color("blue")).unwrap();

        let (id, outcome) = exec.execute_one(&worker()).unwrap().unwrap();
        assert_eq!(id, job_id);
        assert_eq!(outcome, JobOutcome::Succeeded { operations: 1 });
        assert_eq!(color(&f), json!("blue"));
        assert_eq!(f.journal.records_for_job(job_id).unwrap().len(), 1);
        assert!(f.locks.get("family:sofas").unwrap().is_none());

        let job = f.queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        let runs = f.queue.run_summaries(job_id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].operations_applied, 1);
        assert_eq!(exec.stats().jobs_succeeded, 1);
    }

    #[test]
    fn kill_switch_forces_dry_run() {
        let f = fixture();
        let exec = executor(
            &f,
            HandlerRegistry::catalog_defaults(),
            config().with_apply_enabled(false),
        );
        let job_id = f.queue.enqueue(fix_color("blue")).unwrap();

        let (_, outcome) = exec.execute_one(&worker()).unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Succeeded { operations: 0 });
        assert_eq!(color(&f), json!("red"));
        assert!(f.journal.is_empty());
        assert_eq!(f.queue.get(job_id).unwrap().unwrap().status, JobStatus::Succeeded);
    }

    #[test]
    fn producer_requested_dry_run_is_honoured() {
        let f = fixture();
        let exec = executor(&f, HandlerRegistry::catalog_defaults(), config());
        f.queue.enqueue(fix_color("blue").dry_run()).unwrap();

        exec.execute_one(&worker()).unwrap();
        assert_eq!(color(&f), json!("red"));
        assert!(f.journal.is_empty());
    }

    #[test]
    fn undecodable_payload_is_dead_lettered_without_consuming_attempts() {
        let f = fixture();
        let exec = executor(&f, HandlerRegistry::catalog_defaults(), config());
        let job_id = f
            .queue
            .enqueue(NewJob::new(JobType::Merge, json!({"nonsense": true})))
            .unwrap();

        let (_, outcome) = exec.execute_one(&worker()).unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::DeadLettered);
        let job = f.queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Deadletter);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.unwrap().contains("undecodable payload"));
    }

    #[test]
    fn missing_handler_is_dead_lettered() {
        let f = fixture();
        let exec = executor(&f, HandlerRegistry::new(), config());
        let job_id = f.queue.enqueue(fix_color("blue")).unwrap();

        exec.execute_one(&worker()).unwrap();
        let job = f.queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Deadletter);
        assert!(job.last_error.unwrap().contains("no handler registered"));
    }

    #[test]
    fn validation_failure_is_dead_lettered() {
        let f = fixture();
        let engine = Arc::new(ApplyEngine::new(
            f.journal.clone(),
            f.catalog.clone(),
            Arc::new(|_: &crate::apply::ChangePlan| {
                ValidationOutcome::rejected(vec!["frozen family".to_string()])
            }),
        ));
        let exec = JobExecutor::new(
            f.queue.clone(),
            f.locks.clone(),
            engine,
            Arc::new(HandlerRegistry::catalog_defaults()),
            config(),
        );
        let job_id = f.queue.enqueue(fix_color("blue")).unwrap();

        let (_, outcome) = exec.execute_one(&worker()).unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::DeadLettered);
        let job = f.queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.unwrap().contains("frozen family"));
        assert_eq!(color(&f), json!("red"));
    }

    #[test]
    fn handler_panic_fails_the_attempt_and_releases_locks() {
        let f = fixture();
        let mut registry = HandlerRegistry::new();
        registry.register(
            JobType::TargetedFix,
            |_: &HandlerContext<'_>| -> Result<Vec<crate::apply::ChangePlan>, HandlerError> {
                panic!("catalog exploded")
            },
        );
        let exec = executor(&f, registry, config());
        let job_id = f.queue.enqueue(fix_color("blue")).unwrap();

        let (_, outcome) = exec.execute_one(&worker()).unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Retrying { attempts: 1 });
        assert!(f.locks.get("family:sofas").unwrap().is_none());

        let job = f.queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.last_error.unwrap().contains("catalog exploded"));
    }

    #[test]
    fn busy_lock_retries_locally_then_fails_the_attempt() {
        let f = fixture();
        f.locks
            .acquire("family:sofas", "someone-else", Duration::from_secs(60))
            .unwrap();
        let exec = executor(&f, HandlerRegistry::catalog_defaults(), config());
        let job_id = f.queue.enqueue(fix_color("blue")).unwrap();

        let (_, outcome) = exec.execute_one(&worker()).unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Retrying { attempts: 1 });
        assert_eq!(exec.stats().lock_busy_retries, 2);
        assert!(
            f.queue
                .get(job_id)
                .unwrap()
                .unwrap()
                .last_error
                .unwrap()
                .contains("someone-else")
        );
    }

    /// Stalls the worker past its lease on the first lock acquisition and lets
    /// the watchdog recover the job, before or after the lock is taken.
    struct StallingLocks {
        inner: Arc<InMemoryLockManager>,
        clock: ManualClock,
        watchdog: Mutex<Option<Watchdog>>,
        sweep_first: bool,
    }

    impl StallingLocks {
        fn stall(&self) {
            let Some(watchdog) = self.watchdog.lock().unwrap().take() else {
                return;
            };
            self.clock.advance(chrono::Duration::seconds(61));
            assert_eq!(watchdog.sweep().unwrap().requeued.len(), 1);
        }
    }

    impl LockManager for StallingLocks {
        fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<Lock, LockError> {
            if self.sweep_first {
                self.stall();
                return self.inner.acquire(key, owner, ttl);
            }
            let lock = self.inner.acquire(key, owner, ttl)?;
            self.stall();
            Ok(lock)
        }

        fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<Lock, LockError> {
            self.inner.renew(key, owner, ttl)
        }

        fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
            self.inner.release(key, owner)
        }

        fn force_release(&self, key: &str) -> Result<bool, LockError> {
            self.inner.force_release(key)
        }

        fn force_release_stale(
            &self,
            key: &str,
            owner_prefix: &str,
            acquired_before: DateTime<Utc>,
        ) -> Result<bool, LockError> {
            self.inner.force_release_stale(key, owner_prefix, acquired_before)
        }

        fn get(&self, key: &str) -> Result<Option<Lock>, LockError> {
            self.inner.get(key)
        }
    }

    fn lease_lost_then_retried(sweep_first: bool) {
        let clock = ManualClock::starting_now();
        let queue = Arc::new(InMemoryJobQueue::with_clock(
            QueueConfig {
                lease_ttl: Duration::from_secs(60),
                retry: RetryPolicy::immediate(3),
            },
            Arc::new(clock.clone()),
        ));
        let inner = Arc::new(InMemoryLockManager::with_clock(Arc::new(clock.clone())));
        let f = Fixture {
            queue: queue.clone(),
            locks: inner.clone(),
            ..fixture()
        };
        let watchdog = Watchdog::new(queue.clone(), inner.clone(), f.journal.clone())
            .with_clock(Arc::new(clock.clone()));
        let locks = Arc::new(StallingLocks {
            inner: inner.clone(),
            clock,
            watchdog: Mutex::new(Some(watchdog)),
            sweep_first,
        });
        let exec = JobExecutor::new(
            queue.clone(),
            locks,
            f.engine.clone(),
            Arc::new(HandlerRegistry::catalog_defaults()),
            config(),
        );
        let job_id = queue.enqueue(fix_color("blue")).unwrap();

        let (_, outcome) = exec.execute_one(&worker()).unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::LeaseLost);
        assert!(inner.get("family:sofas").unwrap().is_none());
        assert_eq!(color(&f), json!("red"));

        // The next attempt gets the resource straight away.
        let (_, outcome) = exec.execute_one(&WorkerId::from("worker-2")).unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Succeeded { operations: 1 });
        assert_eq!(exec.stats().lock_busy_retries, 0);
        let job = queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 0);
        assert_eq!(color(&f), json!("blue"));
    }

    #[test]
    fn lease_lost_before_locking_releases_the_locks_it_then_took() {
        lease_lost_then_retried(true);
    }

    #[test]
    fn lease_lost_after_locking_leaves_cleanup_to_the_watchdog() {
        lease_lost_then_retried(false);
    }

    #[test]
    fn merge_larger_than_one_plan_succeeds_in_chunks() {
        let f = fixture();
        for i in 0..501 {
            f.catalog.insert(CatalogEntity::new(
                EntityId::from(format!("bulk-{i:04}").as_str()),
                FamilyId::from("armchairs"),
                serde_json::Map::new(),
            ));
        }
        let payload = JobPayload::Merge(MergePayload {
            source_family_id: FamilyId::from("armchairs"),
            target_family_id: FamilyId::from("chairs"),
        });
        let job_id = f
            .queue
            .enqueue(NewJob::new(JobType::Merge, payload.to_value()))
            .unwrap();
        let exec = executor(&f, HandlerRegistry::catalog_defaults(), config());

        let (_, outcome) = exec.execute_one(&worker()).unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Succeeded { operations: 501 });
        assert!(f.catalog.list_family(&FamilyId::from("armchairs")).unwrap().is_empty());
        assert_eq!(f.catalog.list_family(&FamilyId::from("chairs")).unwrap().len(), 501);
        assert_eq!(f.journal.records_for_job(job_id).unwrap().len(), 3);
    }

    #[test]
    fn spawned_worker_drains_queue_and_shuts_down() {
        let f = fixture();
        let exec = executor(&f, HandlerRegistry::catalog_defaults(), config());
        let job_id = f.queue.enqueue(fix_color("green")).unwrap();

        let handle = exec.spawn(worker()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.queue.get(job_id).unwrap().unwrap().status != JobStatus::Succeeded {
            assert!(Instant::now() < deadline, "job never finished");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.stats().jobs_succeeded, 1);
        handle.shutdown();
        assert_eq!(color(&f), json!("green"));
    }
}
