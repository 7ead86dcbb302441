//! Per-resource locking.
//!
//! ## Design
//!
//! - One row per resource key; at most one live (non-expired) lock per key
//! - Acquire is a single compare-and-set; an expired row counts as absent
//! - Locks are owned by one attempt of a job (`attempt_owner`) and renewed while it runs
//! - Multi-resource jobs lock keys in lexicographic order (`LockGuard::acquire_all`)
//! - Only the watchdog breaks a lock it does not own (`force_release_stale`), and
//!   only locks a recovered attempt took before its lease was reclaimed
//!
//! ## Components
//!
//! - `LockManager`: lock storage abstraction
//! - `InMemoryLockManager`: tests/dev backend on an injected clock
//! - `PostgresLockManager`: durable backend comparing against `NOW()`
//! - `LockGuard`: scoped release on every exit path

pub mod guard;
pub mod postgres;
pub mod store;
pub mod types;

pub use guard::LockGuard;
pub use postgres::PostgresLockManager;
pub use store::{InMemoryLockManager, LockManager};
pub use types::{Lock, LockError, attempt_owner, job_owner_prefix};
