//! Scoped multi-resource locking.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::store::LockManager;
use super::types::LockError;

/// Holds one or more resource locks and releases them when dropped.
///
/// Release happens on every exit path (early return, `?`, unwinding panic),
/// in reverse acquisition order.
pub struct LockGuard {
    manager: Arc<dyn LockManager>,
    owner: String,
    ttl: Duration,
    keys: Vec<String>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("owner", &self.owner)
            .field("keys", &self.keys)
            .finish()
    }
}

impl LockGuard {
    /// Acquire every key in lexicographic order (deduplicated).
    ///
    /// A fixed global order keeps two jobs that need the same pair of
    /// resources from deadlocking. On the first busy key, everything acquired
    /// so far is released and the error is returned.
    pub fn acquire_all(
        manager: Arc<dyn LockManager>,
        keys: &[String],
        owner: &str,
        ttl: Duration,
    ) -> Result<Self, LockError> {
        let mut ordered = keys.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guard = LockGuard {
            manager,
            owner: owner.to_string(),
            ttl,
            keys: Vec::with_capacity(ordered.len()),
        };

        for key in ordered {
            guard.manager.acquire(&key, owner, ttl)?;
            guard.keys.push(key);
        }

        debug!(owner = %guard.owner, keys = ?guard.keys, "resource locks acquired");
        Ok(guard)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Extend every held lock by the guard's TTL.
    pub fn renew(&self) -> Result<(), LockError> {
        for key in &self.keys {
            self.manager.renew(key, &self.owner, self.ttl)?;
        }
        Ok(())
    }

    /// Release now instead of at drop, surfacing the first error.
    pub fn release(mut self) -> Result<(), LockError> {
        let keys = std::mem::take(&mut self.keys);
        let mut first_err = None;
        for key in keys.iter().rev() {
            if let Err(e) = self.manager.release(key, &self.owner) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        for key in self.keys.iter().rev() {
            if let Err(e) = self.manager.release(key, &self.owner) {
                warn!(owner = %self.owner, resource_key = %key, error = %e, "failed to release resource lock");
            }
        }
    }
}
