//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use catalogops_core::{DomainError, WorkerId};

pub use catalogops_core::JobId;

/// Job type used to route a job to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Correct field values on a single entity
    TargetedFix,
    /// Create a new entity inside a family
    AddEntity,
    /// Read-only completeness check over a family
    Audit,
    /// Fold one family into another
    Merge,
    /// Move part of a family into a new family
    Split,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::TargetedFix,
        JobType::AddEntity,
        JobType::Audit,
        JobType::Merge,
        JobType::Split,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::TargetedFix => "targeted_fix",
            JobType::AddEntity => "add_entity",
            JobType::Audit => "audit",
            JobType::Merge => "merge",
            JobType::Split => "split",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Job lifecycle status.
///
/// `queued → leased → running → succeeded`, with `fail` sending a leased or
/// running job back to `queued` (retry) or on to `deadletter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed (possibly not yet visible, see `not_before`)
    Queued,
    /// Claimed by a worker, lock not yet acquired
    Leased,
    /// Handler executing
    Running,
    /// Completed successfully
    Succeeded,
    /// Exhausted retries or failed irrecoverably
    Deadletter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Leased => "leased",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Deadletter => "deadletter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Deadletter)
    }

    /// Whether a worker lease is attached in this status.
    pub fn holds_lease(&self) -> bool {
        matches!(self, JobStatus::Leased | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "leased" => Ok(JobStatus::Leased),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "deadletter" => Ok(JobStatus::Deadletter),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Retry policy: attempt budget plus capped exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before a job is dead-lettered
    pub max_attempts: u32,
    /// Base delay, doubled per attempt
    pub base_delay: Duration,
    /// Maximum delay cap (before jitter)
    pub max_delay: Duration,
    /// Upper bound of the uniform random jitter added to every delay
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(300),
            max_delay: Duration::from_secs(3600),
            jitter: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that retries immediately (tests, local runs).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// `min(base * 2^attempts, max)` without jitter.
    pub fn capped_delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Delay before the next attempt becomes visible.
    pub fn backoff(&self, attempts: u32) -> Duration {
        self.backoff_with(attempts, &mut rand::thread_rng())
    }

    pub fn backoff_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        };
        self.capped_delay(attempts).saturating_add(jitter)
    }

    /// Check if another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// A job as submitted by a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    /// Higher runs first
    pub priority: i32,
    /// Request a preview-only run regardless of the global apply switch
    pub dry_run: bool,
}

impl NewJob {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            job_type,
            payload,
            priority: 0,
            dry_run: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// A durable job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    /// Opaque JSON interpreted by the handler for `job_type`
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: i32,
    /// Failed attempts so far
    pub attempts: u32,
    /// Set together with `lease_expires_at`
    pub lease_owner: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Retry visibility: the job cannot be claimed before this instant
    pub not_before: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Job {
    pub(crate) fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type: new.job_type,
            payload: new.payload,
            status: JobStatus::Queued,
            priority: new.priority,
            attempts: 0,
            lease_owner: None,
            lease_expires_at: None,
            not_before: None,
            dry_run: new.dry_run,
            created_at: now,
            started_at: None,
            updated_at: now,
            last_error: None,
        }
    }

    /// Queued and past its retry visibility timestamp.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.not_before.is_none_or(|at| at <= now)
    }

    /// Holds a lease that ran out before `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.holds_lease() && self.lease_expires_at.is_some_and(|at| at < now)
    }

    pub fn is_leased_by(&self, worker: &WorkerId) -> bool {
        self.status.holds_lease() && self.lease_owner.as_ref() == Some(worker)
    }

    pub(crate) fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

/// Measurements the executor reports when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub duration_ms: u64,
    pub operations_applied: u32,
}

/// One row per execution attempt, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    /// Attempt number this run counted as (1-indexed)
    pub attempt: u32,
    /// Job status after the run was recorded
    pub status: JobStatus,
    pub duration_ms: u64,
    pub operations_applied: u32,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub(crate) fn for_job(
        job: &Job,
        worker: &WorkerId,
        attempt: u32,
        report: RunReport,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job.id,
            worker_id: worker.clone(),
            attempt,
            status: job.status,
            duration_ms: report.duration_ms,
            operations_applied: report.operations_applied,
            error,
            finished_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            jitter: Duration::ZERO,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.backoff(0), Duration::from_secs(300));
        assert_eq!(policy.backoff(1), Duration::from_secs(600));
        assert_eq!(policy.backoff(2), Duration::from_secs(1200));
        assert_eq!(policy.backoff(3), Duration::from_secs(2400));
        assert_eq!(policy.backoff(4), Duration::from_secs(3600));
        assert_eq!(policy.backoff(40), Duration::from_secs(3600));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn job_type_and_status_parse_their_own_names() {
        for t in JobType::ALL {
            assert_eq!(t.as_str().parse::<JobType>().unwrap(), t);
        }
        assert!("reindex".parse::<JobType>().is_err());
        assert_eq!("deadletter".parse::<JobStatus>().unwrap(), JobStatus::Deadletter);
    }

    #[test]
    fn retry_visibility_hides_backed_off_jobs() {
        let now = Utc::now();
        let mut job = Job::from_new(NewJob::new(JobType::Audit, serde_json::json!({})), now);
        assert!(job.is_claimable(now));

        job.not_before = Some(now + chrono::Duration::seconds(10));
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + chrono::Duration::seconds(10)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: backoff never decreases with more attempts (ignoring jitter)
        /// and never exceeds the cap.
        #[test]
        fn capped_delay_is_monotonic(
            base in 0u64..10_000,
            max in 0u64..100_000,
            attempts in 0u32..64,
        ) {
            let policy = RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(base),
                max_delay: Duration::from_secs(max),
                jitter: Duration::ZERO,
            };

            let current = policy.capped_delay(attempts);
            let next = policy.capped_delay(attempts + 1);
            prop_assert!(next >= current);
            prop_assert!(current <= Duration::from_secs(max));
        }

        /// Property: jitter stays within `[0, jitter]` on top of the capped delay.
        #[test]
        fn jitter_stays_in_bounds(
            seed in any::<u64>(),
            attempts in 0u32..16,
            jitter_secs in 0u64..120,
        ) {
            let policy = RetryPolicy {
                jitter: Duration::from_secs(jitter_secs),
                ..RetryPolicy::default()
            };
            let mut rng = StdRng::seed_from_u64(seed);

            let delay = policy.backoff_with(attempts, &mut rng);
            let floor = policy.capped_delay(attempts);
            prop_assert!(delay >= floor);
            prop_assert!(delay <= floor + Duration::from_secs(jitter_secs));
        }
    }
}
