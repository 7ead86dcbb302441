//! Database wiring shared by the Postgres backends.
//!
//! The store traits are synchronous (workers are plain threads), while `sqlx`
//! is async. Each backend keeps a handle to the runtime that owns its pool and
//! drives queries with `block_on` from the calling worker thread.

use std::future::Future;
use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;

/// Orchestration schema (jobs, run summaries, locks, idempotency, journal, catalog).
pub const SCHEMA: &str = include_str!("../migrations/0001_orchestration.sql");

/// Pool plus the runtime that drives it.
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PgBackend {
    /// Must be called from inside the runtime that will own the pool.
    pub fn new(pool: PgPool) -> Self {
        Self::with_runtime(pool, Handle::current())
    }

    pub fn with_runtime(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `fut` to completion from synchronous code.
    ///
    /// Off-runtime threads block directly; a multi-threaded runtime worker
    /// first moves itself out of the scheduler with `block_in_place`.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        match Handle::try_current() {
            Ok(_) => tokio::task::block_in_place(|| self.runtime.block_on(fut)),
            Err(_) => self.runtime.block_on(fut),
        }
    }
}

/// Connect and make sure the schema exists.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    apply_schema(&pool).await?;
    Ok(pool)
}

/// Idempotent: every statement in the schema is `IF NOT EXISTS`.
pub async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Unique constraint violation (`23505`).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Human-readable description of a sqlx failure for store error variants.
pub(crate) fn describe_sqlx_error(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ),
            None => format!("database error in {operation}: {}", db_err.message()),
        },
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        sqlx::Error::RowNotFound => format!("unexpected row not found in {operation}"),
        _ => format!("sqlx error in {operation}: {err}"),
    }
}
