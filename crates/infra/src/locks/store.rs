//! Lock manager abstraction and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use catalogops_core::{Clock, SystemClock};

use super::types::{Lock, LockError};
use crate::jobs::store::to_chrono;

/// Exclusive, renewable, time-bounded locks keyed by resource name.
pub trait LockManager: Send + Sync {
    /// Compare-and-set: succeeds only when no live lock exists for the key.
    fn acquire(&self, resource_key: &str, owner: &str, ttl: Duration) -> Result<Lock, LockError>;

    /// Extend a live lock held by `owner`.
    fn renew(&self, resource_key: &str, owner: &str, ttl: Duration) -> Result<Lock, LockError>;

    /// Release a lock held by `owner`.
    fn release(&self, resource_key: &str, owner: &str) -> Result<(), LockError>;

    /// Drop the lock regardless of owner. Returns whether a row was removed.
    fn force_release(&self, resource_key: &str) -> Result<bool, LockError>;

    /// Drop the row (live or expired) if its owner starts with `owner_prefix`
    /// and it was acquired before `acquired_before`. Locks taken at or after
    /// the cutoff belong to a later attempt and are left alone.
    fn force_release_stale(
        &self,
        resource_key: &str,
        owner_prefix: &str,
        acquired_before: DateTime<Utc>,
    ) -> Result<bool, LockError>;

    /// Current row for the key, live or expired.
    fn get(&self, resource_key: &str) -> Result<Option<Lock>, LockError>;
}

/// In-memory lock manager for tests/dev.
#[derive(Debug)]
pub struct InMemoryLockManager {
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Lock>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn locks(&self) -> Result<MutexGuard<'_, HashMap<String, Lock>>, LockError> {
        self.locks
            .lock()
            .map_err(|_| LockError::Storage("lock table poisoned".to_string()))
    }
}

impl Default for InMemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager for InMemoryLockManager {
    fn acquire(&self, resource_key: &str, owner: &str, ttl: Duration) -> Result<Lock, LockError> {
        let mut locks = self.locks()?;
        let now = self.clock.now();

        if let Some(existing) = locks.get(resource_key) {
            if existing.is_live(now) {
                return Err(LockError::Busy {
                    resource_key: resource_key.to_string(),
                    held_by: existing.owner.clone(),
                    expires_at: existing.expires_at,
                });
            }
        }

        let lock = Lock {
            resource_key: resource_key.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now + to_chrono(ttl),
        };
        locks.insert(resource_key.to_string(), lock.clone());
        Ok(lock)
    }

    fn renew(&self, resource_key: &str, owner: &str, ttl: Duration) -> Result<Lock, LockError> {
        let mut locks = self.locks()?;
        let now = self.clock.now();

        match locks.get_mut(resource_key) {
            Some(lock) if lock.owner == owner && lock.is_live(now) => {
                lock.expires_at = now + to_chrono(ttl);
                Ok(lock.clone())
            }
            _ => Err(LockError::NotOwner {
                resource_key: resource_key.to_string(),
                owner: owner.to_string(),
            }),
        }
    }

    fn release(&self, resource_key: &str, owner: &str) -> Result<(), LockError> {
        let mut locks = self.locks()?;
        match locks.get(resource_key) {
            Some(lock) if lock.owner == owner => {
                locks.remove(resource_key);
                Ok(())
            }
            _ => Err(LockError::NotOwner {
                resource_key: resource_key.to_string(),
                owner: owner.to_string(),
            }),
        }
    }

    fn force_release(&self, resource_key: &str) -> Result<bool, LockError> {
        Ok(self.locks()?.remove(resource_key).is_some())
    }

    fn force_release_stale(
        &self,
        resource_key: &str,
        owner_prefix: &str,
        acquired_before: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        let mut locks = self.locks()?;
        let stale = locks
            .get(resource_key)
            .is_some_and(|l| l.owner.starts_with(owner_prefix) && l.acquired_at < acquired_before);
        if stale {
            locks.remove(resource_key);
        }
        Ok(stale)
    }

    fn get(&self, resource_key: &str) -> Result<Option<Lock>, LockError> {
        Ok(self.locks()?.get(resource_key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalogops_core::ManualClock;
    use std::sync::Barrier;
    use std::thread;

    const TTL: Duration = Duration::from_secs(30);

    fn manager() -> (InMemoryLockManager, ManualClock) {
        let clock = ManualClock::starting_now();
        (InMemoryLockManager::with_clock(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn second_acquire_is_busy() {
        let (locks, _) = manager();
        locks.acquire("family:a", "job-1", TTL).unwrap();

        let err = locks.acquire("family:a", "job-2", TTL).unwrap_err();
        assert!(err.is_busy());
        match err {
            LockError::Busy { held_by, .. } => assert_eq!(held_by, "job-1"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn expired_lock_is_treated_as_absent() {
        let (locks, clock) = manager();
        locks.acquire("family:a", "job-1", TTL).unwrap();

        clock.advance(chrono::Duration::seconds(31));
        let lock = locks.acquire("family:a", "job-2", TTL).unwrap();
        assert_eq!(lock.owner, "job-2");

        // The previous owner can neither renew nor release the reassigned lock.
        assert!(matches!(
            locks.renew("family:a", "job-1", TTL),
            Err(LockError::NotOwner { .. })
        ));
        assert!(matches!(
            locks.release("family:a", "job-1"),
            Err(LockError::NotOwner { .. })
        ));
    }

    #[test]
    fn renew_extends_only_live_owned_locks() {
        let (locks, clock) = manager();
        let first = locks.acquire("family:a", "job-1", TTL).unwrap();

        clock.advance(chrono::Duration::seconds(20));
        let renewed = locks.renew("family:a", "job-1", TTL).unwrap();
        assert!(renewed.expires_at > first.expires_at);

        clock.advance(chrono::Duration::seconds(31));
        assert!(locks.renew("family:a", "job-1", TTL).is_err());
    }

    #[test]
    fn release_then_reacquire() {
        let (locks, _) = manager();
        locks.acquire("family:a", "job-1", TTL).unwrap();
        locks.release("family:a", "job-1").unwrap();

        assert!(locks.get("family:a").unwrap().is_none());
        locks.acquire("family:a", "job-2", TTL).unwrap();
    }

    #[test]
    fn force_release_ignores_ownership() {
        let (locks, _) = manager();
        locks.acquire("family:a", "job-1", TTL).unwrap();

        assert!(locks.force_release("family:a").unwrap());
        assert!(!locks.force_release("family:a").unwrap());
    }

    #[test]
    fn stale_release_matches_owner_prefix_and_cutoff() {
        let (locks, clock) = manager();
        locks.acquire("family:a", "job-1:worker-1:aaaa", TTL).unwrap();
        clock.advance(chrono::Duration::seconds(5));
        let cutoff = clock.now();

        assert!(!locks.force_release_stale("family:a", "job-9:", cutoff).unwrap());
        let too_early = cutoff - chrono::Duration::seconds(10);
        assert!(!locks.force_release_stale("family:a", "job-1:", too_early).unwrap());
        assert!(locks.get("family:a").unwrap().is_some());
        assert!(locks.force_release_stale("family:a", "job-1:", cutoff).unwrap());
        assert!(locks.get("family:a").unwrap().is_none());

        // A later attempt of the same job, acquired at the cutoff, survives.
        locks.acquire("family:a", "job-1:worker-2:bbbb", TTL).unwrap();
        assert!(!locks.force_release_stale("family:a", "job-1:", cutoff).unwrap());
        assert_eq!(locks.get("family:a").unwrap().unwrap().owner, "job-1:worker-2:bbbb");
    }

    #[test]
    fn concurrent_acquires_have_exactly_one_winner() {
        for _ in 0..20 {
            let locks = Arc::new(InMemoryLockManager::new());
            let barrier = Arc::new(Barrier::new(8));

            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let locks = locks.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        locks.acquire("family:hot", &format!("job-{i}"), TTL).is_ok()
                    })
                })
                .collect();

            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
        }
    }
}
