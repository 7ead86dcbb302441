//! Postgres-backed job queue.
//!
//! ## Claim protocol
//!
//! `claim` is one statement: a CTE selects the next visible queued row with
//! `FOR UPDATE SKIP LOCKED` and the outer `UPDATE` leases it. Two workers
//! racing for the same row never both see it: the loser skips the locked row
//! and moves on to the next one (or gets nothing).
//!
//! ## Fenced transitions
//!
//! Every call after `claim` runs in a transaction that first locks the job row
//! (`SELECT .. FOR UPDATE`) and checks the caller still holds the lease, using
//! the same fencing rules as the in-memory queue.
//!
//! Lease timestamps are computed from the database's `NOW()`.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, instrument};

use catalogops_core::WorkerId;

use super::store::{JobQueue, JobQueueError, JobStats, QueueConfig, ensure_leased_by};
use super::types::{Job, JobId, JobStatus, NewJob, RunReport, RunSummary};
use crate::db::{PgBackend, describe_sqlx_error};

const JOB_COLUMNS: &str = "id, job_type, status, payload, priority, attempts, lease_owner, \
     lease_expires_at, not_before, dry_run, created_at, started_at, updated_at, last_error";

/// Postgres-backed durable job queue.
#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    backend: PgBackend,
    config: QueueConfig,
}

impl PostgresJobQueue {
    pub fn new(backend: PgBackend, config: QueueConfig) -> Self {
        Self { backend, config }
    }

    fn lease_ttl_ms(&self) -> i64 {
        self.config.lease_ttl.as_millis() as i64
    }

    #[instrument(skip(self, job), fields(job_type = %job.job_type), err)]
    pub async fn insert_job(&self, job: NewJob) -> Result<JobId, JobQueueError> {
        let job_id = JobId::new();
        sqlx::query(
            r#"
            INSERT INTO catalog_jobs (id, job_type, status, payload, priority, dry_run)
            VALUES ($1, $2, 'queued', $3, $4, $5)
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.dry_run)
        .execute(self.backend.pool())
        .await
        .map_err(|e| {
            if crate::db::is_unique_violation(&e) {
                JobQueueError::AlreadyExists(job_id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(job_id)
    }

    pub async fn load_job(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM catalog_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(self.backend.pool())
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(worker = %worker), err)]
    pub async fn claim_next(&self, worker: &WorkerId) -> Result<Option<Job>, JobQueueError> {
        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                FROM catalog_jobs
                WHERE status = 'queued'
                  AND (not_before IS NULL OR not_before <= NOW())
                ORDER BY priority DESC, created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE catalog_jobs j
            SET status = 'leased',
                lease_owner = $1,
                lease_expires_at = NOW() + ($2::bigint) * INTERVAL '1 millisecond',
                not_before = NULL,
                updated_at = NOW()
            FROM next
            WHERE j.id = next.id
            RETURNING j.id, j.job_type, j.status, j.payload, j.priority, j.attempts,
                      j.lease_owner, j.lease_expires_at, j.not_before, j.dry_run,
                      j.created_at, j.started_at, j.updated_at, j.last_error
            "#,
        )
        .bind(worker.as_str())
        .bind(self.lease_ttl_ms())
        .fetch_optional(self.backend.pool())
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Lock the job row and check the caller's lease.
    async fn lock_leased_job(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        worker: &WorkerId,
        action: &'static str,
        allowed: &[JobStatus],
    ) -> Result<Job, JobQueueError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM catalog_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?
        .ok_or(JobQueueError::NotFound(job_id))?;

        let job = job_from_row(&row)?;
        ensure_leased_by(&job, worker, action, allowed)?;
        Ok(job)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobQueueError> {
        self.backend
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    #[instrument(skip(self), fields(job_id = %job_id, worker = %worker, action = %action), err)]
    async fn transition(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        action: &'static str,
        allowed: &[JobStatus],
        update_sql: &str,
        lease_ttl_ms: Option<i64>,
        run: Option<(RunReport, Option<String>)>,
    ) -> Result<Job, JobQueueError> {
        let mut tx = self.begin().await?;
        Self::lock_leased_job(&mut tx, job_id, worker, action, allowed).await?;

        // `$2` is bound only for statements that extend the lease.
        let mut query = sqlx::query(update_sql).bind(job_id.as_uuid());
        if let Some(ttl) = lease_ttl_ms {
            query = query.bind(ttl);
        }
        let row = query
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(action, e))?;
        let job = job_from_row(&row)?;

        if let Some((report, error)) = run {
            // Transitions through here never consume an attempt.
            let summary =
                RunSummary::for_job(&job, worker, job.attempts + 1, report, error, job.updated_at);
            insert_run(&mut tx, &summary).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id, worker = %worker), err)]
    pub async fn fail_job(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        report: RunReport,
    ) -> Result<Job, JobQueueError> {
        let mut tx = self.begin().await?;
        let current = Self::lock_leased_job(
            &mut tx,
            job_id,
            worker,
            "fail",
            &[JobStatus::Leased, JobStatus::Running],
        )
        .await?;

        let attempts = current.attempts + 1;
        let retry = &self.config.retry;
        let (status, delay_ms) = if retry.should_retry(attempts) {
            (JobStatus::Queued, Some(retry.backoff(attempts).as_millis() as i64))
        } else {
            (JobStatus::Deadletter, None)
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE catalog_jobs
            SET status = $2,
                attempts = $3,
                lease_owner = NULL,
                lease_expires_at = NULL,
                not_before = CASE WHEN $4::bigint IS NULL THEN NULL
                                  ELSE NOW() + ($4::bigint) * INTERVAL '1 millisecond' END,
                last_error = $5,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(status.as_str())
        .bind(attempts as i32)
        .bind(delay_ms)
        .bind(error)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail_job", e))?;
        let job = job_from_row(&row)?;

        let summary = RunSummary::for_job(
            &job,
            worker,
            job.attempts,
            report,
            Some(error.to_string()),
            job.updated_at,
        );
        insert_run(&mut tx, &summary).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(job_id = %job_id, status = %job.status, attempts = job.attempts, "job failure recorded");
        Ok(job)
    }

    #[instrument(skip(self), err)]
    pub async fn recover_expired_jobs(&self) -> Result<Vec<Job>, JobQueueError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE catalog_jobs
            SET status = 'queued',
                last_error = 'lease expired while held by ' || COALESCE(lease_owner, ''),
                lease_owner = NULL,
                lease_expires_at = NULL,
                not_before = NULL,
                updated_at = NOW()
            WHERE status IN ('leased', 'running')
              AND lease_expires_at < NOW()
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .fetch_all(self.backend.pool())
        .await
        .map_err(|e| map_sqlx_error("recover_expired_jobs", e))?;

        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobQueueError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM catalog_jobs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(self.backend.pool())
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn load_runs(&self, job_id: JobId) -> Result<Vec<RunSummary>, JobQueueError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, worker_id, attempt, status, duration_ms, operations_applied, error, finished_at
            FROM catalog_job_runs
            WHERE job_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(self.backend.pool())
        .await
        .map_err(|e| map_sqlx_error("load_runs", e))?;

        rows.iter().map(run_from_row).collect()
    }

    pub async fn count_by_status(&self) -> Result<JobStats, JobQueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM catalog_jobs GROUP BY status")
            .fetch_all(self.backend.pool())
            .await
            .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(read_err)?;
            let n: i64 = row.try_get("n").map_err(read_err)?;
            stats.add(parse_status(&status)?, n.max(0) as usize);
        }
        Ok(stats)
    }
}

impl JobQueue for PostgresJobQueue {
    fn enqueue(&self, job: NewJob) -> Result<JobId, JobQueueError> {
        self.backend.block_on(self.insert_job(job))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        self.backend.block_on(self.load_job(job_id))
    }

    fn claim(&self, worker: &WorkerId) -> Result<Option<Job>, JobQueueError> {
        self.backend.block_on(self.claim_next(worker))
    }

    fn mark_running(&self, job_id: JobId, worker: &WorkerId) -> Result<Job, JobQueueError> {
        let sql = mark_running_sql();
        self.backend.block_on(self.transition(
            job_id,
            worker,
            "start",
            &[JobStatus::Leased],
            &sql,
            Some(self.lease_ttl_ms()),
            None,
        ))
    }

    fn renew_lease(
        &self,
        job_id: JobId,
        worker: &WorkerId,
    ) -> Result<DateTime<Utc>, JobQueueError> {
        let sql = renew_lease_sql();
        let job = self.backend.block_on(self.transition(
            job_id,
            worker,
            "renew lease",
            &[JobStatus::Leased, JobStatus::Running],
            &sql,
            Some(self.lease_ttl_ms()),
            None,
        ))?;
        job.lease_expires_at
            .ok_or_else(|| JobQueueError::Storage("renewed lease has no expiry".to_string()))
    }

    fn complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        report: RunReport,
    ) -> Result<Job, JobQueueError> {
        let sql = complete_sql();
        self.backend.block_on(self.transition(
            job_id,
            worker,
            "complete",
            &[JobStatus::Running],
            &sql,
            None,
            Some((report, None)),
        ))
    }

    fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        report: RunReport,
    ) -> Result<Job, JobQueueError> {
        self.backend.block_on(self.fail_job(job_id, worker, error, report))
    }

    fn dead_letter(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &str,
        report: RunReport,
    ) -> Result<Job, JobQueueError> {
        let sql = dead_letter_sql();
        self.backend.block_on(async {
            let mut tx = self.begin().await?;
            Self::lock_leased_job(
                &mut tx,
                job_id,
                worker,
                "dead-letter",
                &[JobStatus::Leased, JobStatus::Running],
            )
            .await?;

            let row = sqlx::query(&sql)
                .bind(job_id.as_uuid())
                .bind(error)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("dead_letter", e))?;
            let job = job_from_row(&row)?;

            let summary = RunSummary::for_job(
                &job,
                worker,
                job.attempts + 1,
                report,
                Some(error.to_string()),
                job.updated_at,
            );
            insert_run(&mut tx, &summary).await?;

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Ok(job)
        })
    }

    fn recover_expired(&self) -> Result<Vec<Job>, JobQueueError> {
        self.backend.block_on(self.recover_expired_jobs())
    }

    fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobQueueError> {
        self.backend.block_on(self.list_jobs(status, limit))
    }

    fn run_summaries(&self, job_id: JobId) -> Result<Vec<RunSummary>, JobQueueError> {
        self.backend.block_on(self.load_runs(job_id))
    }

    fn stats(&self) -> Result<JobStats, JobQueueError> {
        self.backend.block_on(self.count_by_status())
    }
}

async fn insert_run(
    tx: &mut Transaction<'_, Postgres>,
    summary: &RunSummary,
) -> Result<(), JobQueueError> {
    sqlx::query(
        r#"
        INSERT INTO catalog_job_runs (
            job_id, worker_id, attempt, status, duration_ms, operations_applied, error, finished_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(summary.job_id.as_uuid())
    .bind(summary.worker_id.as_str())
    .bind(summary.attempt as i32)
    .bind(summary.status.as_str())
    .bind(summary.duration_ms as i64)
    .bind(summary.operations_applied as i32)
    .bind(summary.error.as_deref())
    .bind(summary.finished_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_run", e))?;
    Ok(())
}

fn mark_running_sql() -> String {
    format!(
        r#"
        UPDATE catalog_jobs
        SET status = 'running',
            started_at = NOW(),
            lease_expires_at = NOW() + ($2::bigint) * INTERVAL '1 millisecond',
            updated_at = NOW()
        WHERE id = $1
        RETURNING {JOB_COLUMNS}
        "#
    )
}

fn renew_lease_sql() -> String {
    format!(
        r#"
        UPDATE catalog_jobs
        SET lease_expires_at = NOW() + ($2::bigint) * INTERVAL '1 millisecond',
            updated_at = NOW()
        WHERE id = $1
        RETURNING {JOB_COLUMNS}
        "#
    )
}

fn complete_sql() -> String {
    format!(
        r#"
        UPDATE catalog_jobs
        SET status = 'succeeded',
            lease_owner = NULL,
            lease_expires_at = NULL,
            last_error = NULL,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {JOB_COLUMNS}
        "#
    )
}

fn dead_letter_sql() -> String {
    format!(
        r#"
        UPDATE catalog_jobs
        SET status = 'deadletter',
            lease_owner = NULL,
            lease_expires_at = NULL,
            not_before = NULL,
            last_error = $2,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {JOB_COLUMNS}
        "#
    )
}

fn read_err(e: sqlx::Error) -> JobQueueError {
    JobQueueError::Storage(format!("failed to read job row: {e}"))
}

fn parse_status(raw: &str) -> Result<JobStatus, JobQueueError> {
    raw.parse()
        .map_err(|e| JobQueueError::Storage(format!("corrupt job status: {e}")))
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobQueueError> {
    let job_type: String = row.try_get("job_type").map_err(read_err)?;
    let status: String = row.try_get("status").map_err(read_err)?;
    let lease_owner: Option<String> = row.try_get("lease_owner").map_err(read_err)?;
    let attempts: i32 = row.try_get("attempts").map_err(read_err)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(read_err)?),
        job_type: job_type
            .parse()
            .map_err(|e| JobQueueError::Storage(format!("corrupt job type: {e}")))?,
        payload: row.try_get("payload").map_err(read_err)?,
        status: parse_status(&status)?,
        priority: row.try_get("priority").map_err(read_err)?,
        attempts: attempts.max(0) as u32,
        lease_owner: lease_owner.as_deref().map(WorkerId::from),
        lease_expires_at: row.try_get("lease_expires_at").map_err(read_err)?,
        not_before: row.try_get("not_before").map_err(read_err)?,
        dry_run: row.try_get("dry_run").map_err(read_err)?,
        created_at: row.try_get("created_at").map_err(read_err)?,
        started_at: row.try_get("started_at").map_err(read_err)?,
        updated_at: row.try_get("updated_at").map_err(read_err)?,
        last_error: row.try_get("last_error").map_err(read_err)?,
    })
}

fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<RunSummary, JobQueueError> {
    let status: String = row.try_get("status").map_err(read_err)?;
    let worker_id: String = row.try_get("worker_id").map_err(read_err)?;
    let attempt: i32 = row.try_get("attempt").map_err(read_err)?;
    let duration_ms: i64 = row.try_get("duration_ms").map_err(read_err)?;
    let operations_applied: i32 = row.try_get("operations_applied").map_err(read_err)?;

    Ok(RunSummary {
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(read_err)?),
        worker_id: WorkerId::from(worker_id.as_str()),
        attempt: attempt.max(0) as u32,
        status: parse_status(&status)?,
        duration_ms: duration_ms.max(0) as u64,
        operations_applied: operations_applied.max(0) as u32,
        error: row.try_get("error").map_err(read_err)?,
        finished_at: row.try_get("finished_at").map_err(read_err)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobQueueError {
    JobQueueError::Storage(describe_sqlx_error(operation, &err))
}
