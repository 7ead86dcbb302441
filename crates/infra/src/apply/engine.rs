//! The apply engine: validate, guard with an idempotency key, journal, mutate.

use std::sync::Arc;

use tracing::{debug, info, warn};

use catalogops_core::{Clock, SystemClock};

use super::journal::{JournalError, JournalStore, RecordOutcome};
use super::types::{ApplyMode, ApplyResult, ChangePlan, ChangeRecord, EntityChange};
use super::validation::PlanValidator;
use crate::catalog::store::snapshot_matches;
use crate::catalog::{CatalogError, CatalogReader, CatalogStore};

/// Apply failure. Every variant is transient from the job's point of view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("change record could not be encoded: {0}")]
    Encoding(String),
}

pub struct ApplyEngine {
    journal: Arc<dyn JournalStore>,
    catalog: Arc<dyn CatalogStore>,
    validator: Arc<dyn PlanValidator>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ApplyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyEngine").finish_non_exhaustive()
    }
}

impl ApplyEngine {
    pub fn new(
        journal: Arc<dyn JournalStore>,
        catalog: Arc<dyn CatalogStore>,
        validator: Arc<dyn PlanValidator>,
    ) -> Self {
        Self::with_clock(journal, catalog, validator, Arc::new(SystemClock))
    }

    pub fn with_clock(
        journal: Arc<dyn JournalStore>,
        catalog: Arc<dyn CatalogStore>,
        validator: Arc<dyn PlanValidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            journal,
            catalog,
            validator,
            clock,
        }
    }

    /// Read-only view handed to job handlers.
    pub fn catalog(&self) -> &dyn CatalogReader {
        self.catalog.as_reader()
    }

    pub fn journal(&self) -> &dyn JournalStore {
        self.journal.as_ref()
    }

    /// Apply (or preview) one plan.
    ///
    /// In `Apply` mode the key claim and the change record are written
    /// together before any target is touched. If a later target write fails
    /// the error is returned and a retry of the same plan resumes from the
    /// journaled record.
    pub fn apply(&self, plan: &ChangePlan, mode: ApplyMode) -> Result<ApplyResult, ApplyError> {
        let outcome = self.validator.validate(plan);
        if !outcome.ok {
            debug!(job_id = %plan.job_id, reasons = ?outcome.reasons, "plan rejected by validator");
            return Ok(ApplyResult::ValidationFailed {
                reasons: outcome.reasons,
            });
        }

        let key = plan.resolve_key();

        if mode == ApplyMode::DryRun {
            if self.journal.is_claimed(&key)? {
                let existing = self.journal.find_by_key(&key)?;
                return Ok(ApplyResult::AlreadyApplied {
                    change_record_id: existing.map(|r| r.id),
                    resumed: 0,
                });
            }
            return Ok(ApplyResult::Preview {
                idempotency_key: key,
                changes: plan.changes.clone(),
            });
        }

        let record = ChangeRecord::from_plan(plan, key, self.clock.now())
            .map_err(|e| ApplyError::Encoding(e.to_string()))?;

        match self.journal.record(record)? {
            RecordOutcome::Recorded(record) => {
                for change in &plan.changes {
                    self.catalog
                        .write_snapshot(&change.entity_id, change.after.as_ref())?;
                }
                info!(
                    job_id = %plan.job_id,
                    change_record_id = %record.id,
                    operation = %plan.operation_type,
                    targets = plan.changes.len(),
                    "change applied"
                );
                Ok(ApplyResult::Applied {
                    change_record_id: record.id,
                    operations: plan.changes.len(),
                })
            }
            RecordOutcome::AlreadyApplied(existing) => {
                let resumed = self.resume(&existing)?;
                debug!(
                    job_id = %plan.job_id,
                    change_record_id = %existing.id,
                    resumed,
                    "idempotency key already claimed"
                );
                Ok(ApplyResult::AlreadyApplied {
                    change_record_id: Some(existing.id),
                    resumed,
                })
            }
        }
    }

    /// Bring targets of a journaled record that are still at `before` up to
    /// `after`. Returns the number of targets written.
    fn resume(&self, record: &ChangeRecord) -> Result<usize, ApplyError> {
        let changes = record
            .changes()
            .map_err(|e| ApplyError::Encoding(e.to_string()))?;

        let mut resumed = 0;
        for EntityChange {
            entity_id,
            before,
            after,
        } in &changes
        {
            let current = self.catalog.get(entity_id)?;
            if snapshot_matches(current.as_ref(), after.as_ref()) {
                continue;
            }
            if snapshot_matches(current.as_ref(), before.as_ref()) {
                self.catalog.write_snapshot(entity_id, after.as_ref())?;
                resumed += 1;
            } else {
                warn!(
                    change_record_id = %record.id,
                    entity_id = %entity_id,
                    "target changed since it was journaled; leaving it alone"
                );
            }
        }
        Ok(resumed)
    }
}
