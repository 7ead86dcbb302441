//! Postgres-backed lock manager.
//!
//! Expiry is judged against the database's `NOW()`, so every worker sharing
//! the table compares against one clock regardless of host skew.
//!
//! Acquire is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE expires_at < NOW()`:
//! the row is either inserted, taken over because it expired, or left alone
//! (busy) inside one statement.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use super::store::LockManager;
use super::types::{Lock, LockError};
use crate::db::{PgBackend, describe_sqlx_error};

/// Postgres-backed lock manager.
#[derive(Debug, Clone)]
pub struct PostgresLockManager {
    backend: PgBackend,
}

impl PostgresLockManager {
    pub fn new(backend: PgBackend) -> Self {
        Self { backend }
    }

    #[instrument(skip(self), fields(resource_key = %resource_key, owner = %owner), err)]
    pub async fn acquire_lock(
        &self,
        resource_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Lock, LockError> {
        let row = sqlx::query(
            r#"
            INSERT INTO catalog_locks (resource_key, owner, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + ($3::bigint) * INTERVAL '1 millisecond')
            ON CONFLICT (resource_key) DO UPDATE
            SET owner = EXCLUDED.owner,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE catalog_locks.expires_at < NOW()
            RETURNING resource_key, owner, acquired_at, expires_at
            "#,
        )
        .bind(resource_key)
        .bind(owner)
        .bind(ttl.as_millis() as i64)
        .fetch_optional(self.backend.pool())
        .await
        .map_err(|e| map_sqlx_error("acquire_lock", e))?;

        if let Some(row) = row {
            return lock_from_row(&row);
        }

        // Lost the race to a live holder; report who holds it.
        let holder = self.load_lock(resource_key).await?;
        Err(match holder {
            Some(lock) => LockError::Busy {
                resource_key: resource_key.to_string(),
                held_by: lock.owner,
                expires_at: lock.expires_at,
            },
            None => LockError::Busy {
                resource_key: resource_key.to_string(),
                held_by: "unknown".to_string(),
                expires_at: Utc::now(),
            },
        })
    }

    #[instrument(skip(self), fields(resource_key = %resource_key, owner = %owner), err)]
    pub async fn renew_lock(
        &self,
        resource_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Lock, LockError> {
        let row = sqlx::query(
            r#"
            UPDATE catalog_locks
            SET expires_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond'
            WHERE resource_key = $1 AND owner = $2 AND expires_at > NOW()
            RETURNING resource_key, owner, acquired_at, expires_at
            "#,
        )
        .bind(resource_key)
        .bind(owner)
        .bind(ttl.as_millis() as i64)
        .fetch_optional(self.backend.pool())
        .await
        .map_err(|e| map_sqlx_error("renew_lock", e))?;

        match row {
            Some(row) => lock_from_row(&row),
            None => Err(LockError::NotOwner {
                resource_key: resource_key.to_string(),
                owner: owner.to_string(),
            }),
        }
    }

    #[instrument(skip(self), fields(resource_key = %resource_key, owner = ?owner), err)]
    pub async fn delete_lock(
        &self,
        resource_key: &str,
        owner: Option<&str>,
    ) -> Result<bool, LockError> {
        let result = match owner {
            Some(owner) => {
                sqlx::query("DELETE FROM catalog_locks WHERE resource_key = $1 AND owner = $2")
                    .bind(resource_key)
                    .bind(owner)
                    .execute(self.backend.pool())
                    .await
            }
            None => {
                sqlx::query("DELETE FROM catalog_locks WHERE resource_key = $1")
                    .bind(resource_key)
                    .execute(self.backend.pool())
                    .await
            }
        }
        .map_err(|e| map_sqlx_error("delete_lock", e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete the row if a matching owner took it before `acquired_before`.
    #[instrument(skip(self), fields(resource_key = %resource_key, owner_prefix = %owner_prefix), err)]
    pub async fn delete_stale_lock(
        &self,
        resource_key: &str,
        owner_prefix: &str,
        acquired_before: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        let result = sqlx::query(
            r#"
            DELETE FROM catalog_locks
            WHERE resource_key = $1
              AND left(owner, length($2::text)) = $2::text
              AND acquired_at < $3
            "#,
        )
        .bind(resource_key)
        .bind(owner_prefix)
        .bind(acquired_before)
        .execute(self.backend.pool())
        .await
        .map_err(|e| map_sqlx_error("delete_stale_lock", e))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn load_lock(&self, resource_key: &str) -> Result<Option<Lock>, LockError> {
        let row = sqlx::query(
            r#"
            SELECT resource_key, owner, acquired_at, expires_at
            FROM catalog_locks
            WHERE resource_key = $1
            "#,
        )
        .bind(resource_key)
        .fetch_optional(self.backend.pool())
        .await
        .map_err(|e| map_sqlx_error("load_lock", e))?;

        row.as_ref().map(lock_from_row).transpose()
    }
}

impl LockManager for PostgresLockManager {
    fn acquire(&self, resource_key: &str, owner: &str, ttl: Duration) -> Result<Lock, LockError> {
        self.backend.block_on(self.acquire_lock(resource_key, owner, ttl))
    }

    fn renew(&self, resource_key: &str, owner: &str, ttl: Duration) -> Result<Lock, LockError> {
        self.backend.block_on(self.renew_lock(resource_key, owner, ttl))
    }

    fn release(&self, resource_key: &str, owner: &str) -> Result<(), LockError> {
        if self.backend.block_on(self.delete_lock(resource_key, Some(owner)))? {
            Ok(())
        } else {
            Err(LockError::NotOwner {
                resource_key: resource_key.to_string(),
                owner: owner.to_string(),
            })
        }
    }

    fn force_release(&self, resource_key: &str) -> Result<bool, LockError> {
        self.backend.block_on(self.delete_lock(resource_key, None))
    }

    fn force_release_stale(
        &self,
        resource_key: &str,
        owner_prefix: &str,
        acquired_before: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        self.backend
            .block_on(self.delete_stale_lock(resource_key, owner_prefix, acquired_before))
    }

    fn get(&self, resource_key: &str) -> Result<Option<Lock>, LockError> {
        self.backend.block_on(self.load_lock(resource_key))
    }
}

fn lock_from_row(row: &sqlx::postgres::PgRow) -> Result<Lock, LockError> {
    let read = |e: sqlx::Error| LockError::Storage(format!("failed to read lock row: {e}"));
    Ok(Lock {
        resource_key: row.try_get("resource_key").map_err(read)?,
        owner: row.try_get("owner").map_err(read)?,
        acquired_at: row.try_get::<DateTime<Utc>, _>("acquired_at").map_err(read)?,
        expires_at: row.try_get::<DateTime<Utc>, _>("expires_at").map_err(read)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LockError {
    LockError::Storage(describe_sqlx_error(operation, &err))
}
