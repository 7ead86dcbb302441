//! Lock records and errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use catalogops_core::{JobId, WorkerId};

/// A lease on a contended resource (one row per `resource_key`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub resource_key: String,
    /// Attempt holding the lock, see `attempt_owner`
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    /// A lock past `expires_at` is treated as absent.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Owner string for one attempt of a job: `<job id>:<worker>:<nonce>`.
///
/// Every claim gets a fresh owner, so a worker that lost its lease can never
/// release or renew the locks of the attempt that replaced it.
pub fn attempt_owner(job_id: JobId, worker: &WorkerId) -> String {
    format!("{}{worker}:{}", job_owner_prefix(job_id), Uuid::now_v7().simple())
}

/// Prefix shared by the owners of every attempt of `job_id`.
pub fn job_owner_prefix(job_id: JobId) -> String {
    format!("{job_id}:")
}

/// Lock manager error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// Another owner holds a live lock. Expected contention, not a failure.
    #[error("resource {resource_key} is locked by {held_by} until {expires_at}")]
    Busy {
        resource_key: String,
        held_by: String,
        expires_at: DateTime<Utc>,
    },
    /// The caller does not own a live lock on the resource.
    #[error("{owner} does not hold a live lock on {resource_key}")]
    NotOwner { resource_key: String, owner: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl LockError {
    pub fn is_busy(&self) -> bool {
        matches!(self, LockError::Busy { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_owners_are_unique_and_share_the_job_prefix() {
        let job_id = JobId::new();
        let worker = WorkerId::from("worker-1");
        let first = attempt_owner(job_id, &worker);
        let second = attempt_owner(job_id, &worker);

        assert_ne!(first, second);
        assert!(first.starts_with(&job_owner_prefix(job_id)));
        assert!(second.starts_with(&format!("{job_id}:worker-1:")));
        assert!(!first.starts_with(&job_owner_prefix(JobId::new())));
    }
}
