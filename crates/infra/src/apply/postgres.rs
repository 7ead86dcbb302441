//! Postgres-backed journal.
//!
//! `record` runs in one transaction: `INSERT .. ON CONFLICT DO NOTHING` on the
//! idempotency key decides the winner, and only the winner appends its change
//! record before committing.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use tracing::{debug, instrument};

use catalogops_core::{ChangeRecordId, EntityId, JobId};

use super::journal::{JournalError, JournalStore, RecordOutcome};
use super::types::{ChangeRecord, IdempotencyKey, IdempotencyRecord};
use crate::db::{PgBackend, describe_sqlx_error};

const RECORD_COLUMNS: &str =
    "id, job_id, idempotency_key, operation_type, targets, before, after, applied_at";

#[derive(Debug, Clone)]
pub struct PostgresJournal {
    backend: PgBackend,
}

impl PostgresJournal {
    pub fn new(backend: PgBackend) -> Self {
        Self { backend }
    }

    pub async fn key_exists(&self, key: &IdempotencyKey) -> Result<bool, JournalError> {
        let row = sqlx::query("SELECT 1 AS hit FROM catalog_idempotency WHERE key = $1")
            .bind(key.as_str())
            .fetch_optional(self.backend.pool())
            .await
            .map_err(|e| map_sqlx_error("key_exists", e))?;
        Ok(row.is_some())
    }

    #[instrument(skip(self, record), fields(job_id = %record.job_id, key = %record.idempotency_key), err)]
    pub async fn claim_and_append(&self, record: ChangeRecord) -> Result<RecordOutcome, JournalError> {
        let mut tx = self
            .backend
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO catalog_idempotency (key, job_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(record.idempotency_key.as_str())
        .bind(record.job_id.as_uuid())
        .bind(record.applied_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_idempotency_key", e))?
        .rows_affected()
            > 0;

        if !claimed {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback_transaction", e))?;
            debug!("idempotency key already claimed");
            let existing = self
                .load_by_key(&record.idempotency_key)
                .await?
                .ok_or_else(|| JournalError::MissingRecord(record.idempotency_key.clone()))?;
            return Ok(RecordOutcome::AlreadyApplied(existing));
        }

        let targets = serde_json::to_value(&record.targets)
            .map_err(|e| JournalError::Storage(format!("failed to encode targets: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO catalog_change_records
                (id, job_id, idempotency_key, operation_type, targets, before, after, applied_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.job_id.as_uuid())
        .bind(record.idempotency_key.as_str())
        .bind(&record.operation_type)
        .bind(targets)
        .bind(&record.before)
        .bind(&record.after)
        .bind(record.applied_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("append_change_record", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(RecordOutcome::Recorded(record))
    }

    pub async fn load_by_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ChangeRecord>, JournalError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM catalog_change_records
            WHERE idempotency_key = $1
            ORDER BY applied_at DESC
            LIMIT 1
            "#
        ))
        .bind(key.as_str())
        .fetch_optional(self.backend.pool())
        .await
        .map_err(|e| map_sqlx_error("load_by_key", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn load_for_job(&self, job_id: JobId) -> Result<Vec<ChangeRecord>, JournalError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM catalog_change_records
            WHERE job_id = $1
            ORDER BY applied_at ASC, id ASC
            "#
        ))
        .bind(job_id.as_uuid())
        .fetch_all(self.backend.pool())
        .await
        .map_err(|e| map_sqlx_error("load_for_job", e))?;

        rows.iter().map(record_from_row).collect()
    }

    pub async fn load_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, JournalError> {
        let row = sqlx::query("SELECT key, job_id, created_at FROM catalog_idempotency WHERE key = $1")
            .bind(key.as_str())
            .fetch_optional(self.backend.pool())
            .await
            .map_err(|e| map_sqlx_error("load_key", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let key: String = row.try_get("key").map_err(read_err)?;
        Ok(Some(IdempotencyRecord {
            key: IdempotencyKey::from(key.as_str()),
            job_id: JobId::from_uuid(row.try_get("job_id").map_err(read_err)?),
            created_at: row.try_get("created_at").map_err(read_err)?,
        }))
    }

    #[instrument(skip(self), err)]
    pub async fn delete_keys_before(&self, cutoff: DateTime<Utc>) -> Result<usize, JournalError> {
        let result = sqlx::query("DELETE FROM catalog_idempotency WHERE created_at < $1")
            .bind(cutoff)
            .execute(self.backend.pool())
            .await
            .map_err(|e| map_sqlx_error("delete_keys_before", e))?;
        Ok(result.rows_affected() as usize)
    }
}

impl JournalStore for PostgresJournal {
    fn is_claimed(&self, key: &IdempotencyKey) -> Result<bool, JournalError> {
        self.backend.block_on(self.key_exists(key))
    }

    fn record(&self, record: ChangeRecord) -> Result<RecordOutcome, JournalError> {
        self.backend.block_on(self.claim_and_append(record))
    }

    fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<ChangeRecord>, JournalError> {
        self.backend.block_on(self.load_by_key(key))
    }

    fn records_for_job(&self, job_id: JobId) -> Result<Vec<ChangeRecord>, JournalError> {
        self.backend.block_on(self.load_for_job(job_id))
    }

    fn idempotency_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, JournalError> {
        self.backend.block_on(self.load_key(key))
    }

    fn purge_idempotency_before(&self, cutoff: DateTime<Utc>) -> Result<usize, JournalError> {
        self.backend.block_on(self.delete_keys_before(cutoff))
    }
}

fn read_err(e: sqlx::Error) -> JournalError {
    JournalError::Storage(format!("failed to read journal row: {e}"))
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<ChangeRecord, JournalError> {
    let key: String = row.try_get("idempotency_key").map_err(read_err)?;
    let targets: Value = row.try_get("targets").map_err(read_err)?;
    let targets: Vec<EntityId> = serde_json::from_value(targets)
        .map_err(|e| JournalError::Storage(format!("corrupt change record targets: {e}")))?;

    Ok(ChangeRecord {
        id: ChangeRecordId::from_uuid(row.try_get("id").map_err(read_err)?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(read_err)?),
        idempotency_key: IdempotencyKey::from(key.as_str()),
        operation_type: row.try_get("operation_type").map_err(read_err)?,
        targets,
        before: row.try_get("before").map_err(read_err)?,
        after: row.try_get("after").map_err(read_err)?,
        applied_at: row.try_get("applied_at").map_err(read_err)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JournalError {
    JournalError::Storage(describe_sqlx_error(operation, &err))
}
