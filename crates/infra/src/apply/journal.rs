//! Idempotency keys and the append-only change journal.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use catalogops_core::JobId;

use super::types::{ChangeRecord, IdempotencyKey, IdempotencyRecord};

/// Result of recording a change.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Key claimed and record appended.
    Recorded(ChangeRecord),
    /// Key was already claimed; carries the record written by the first claim.
    AlreadyApplied(ChangeRecord),
}

/// Journal error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalError {
    #[error("idempotency key {0} is claimed but has no change record")]
    MissingRecord(IdempotencyKey),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Idempotency records plus change records.
///
/// `record` claims the key and appends the change record atomically: either
/// both are visible or neither is.
pub trait JournalStore: Send + Sync {
    fn is_claimed(&self, key: &IdempotencyKey) -> Result<bool, JournalError>;

    fn record(&self, record: ChangeRecord) -> Result<RecordOutcome, JournalError>;

    /// Most recent change record written under `key`.
    fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<ChangeRecord>, JournalError>;

    /// Change records of a job, oldest first.
    fn records_for_job(&self, job_id: JobId) -> Result<Vec<ChangeRecord>, JournalError>;

    fn idempotency_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, JournalError>;

    /// Drop idempotency records created before `cutoff`. Change records are kept.
    fn purge_idempotency_before(&self, cutoff: DateTime<Utc>) -> Result<usize, JournalError>;
}

#[derive(Debug, Default)]
struct JournalState {
    keys: HashMap<IdempotencyKey, IdempotencyRecord>,
    records: Vec<ChangeRecord>,
}

/// In-memory journal for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    state: Mutex<JournalState>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, JournalState>, JournalError> {
        self.state
            .lock()
            .map_err(|_| JournalError::Storage("journal lock poisoned".to_string()))
    }

    /// Total change records.
    pub fn len(&self) -> usize {
        self.state().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JournalStore for InMemoryJournal {
    fn is_claimed(&self, key: &IdempotencyKey) -> Result<bool, JournalError> {
        Ok(self.state()?.keys.contains_key(key))
    }

    fn record(&self, record: ChangeRecord) -> Result<RecordOutcome, JournalError> {
        let mut state = self.state()?;

        if state.keys.contains_key(&record.idempotency_key) {
            let existing = state
                .records
                .iter()
                .rev()
                .find(|r| r.idempotency_key == record.idempotency_key)
                .cloned()
                .ok_or_else(|| JournalError::MissingRecord(record.idempotency_key.clone()))?;
            return Ok(RecordOutcome::AlreadyApplied(existing));
        }

        state.keys.insert(
            record.idempotency_key.clone(),
            IdempotencyRecord {
                key: record.idempotency_key.clone(),
                job_id: record.job_id,
                created_at: record.applied_at,
            },
        );
        state.records.push(record.clone());
        Ok(RecordOutcome::Recorded(record))
    }

    fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<ChangeRecord>, JournalError> {
        Ok(self
            .state()?
            .records
            .iter()
            .rev()
            .find(|r| &r.idempotency_key == key)
            .cloned())
    }

    fn records_for_job(&self, job_id: JobId) -> Result<Vec<ChangeRecord>, JournalError> {
        Ok(self
            .state()?
            .records
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    fn idempotency_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, JournalError> {
        Ok(self.state()?.keys.get(key).cloned())
    }

    fn purge_idempotency_before(&self, cutoff: DateTime<Utc>) -> Result<usize, JournalError> {
        let mut state = self.state()?;
        let before = state.keys.len();
        state.keys.retain(|_, r| r.created_at >= cutoff);
        Ok(before - state.keys.len())
    }
}
