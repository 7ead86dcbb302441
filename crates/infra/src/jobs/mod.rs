//! Durable job queue and the executor that drains it.
//!
//! ## Design
//!
//! - Jobs are typed (`JobType`) and carry an opaque JSON payload
//! - Claiming is a lease: the claiming worker owns the job until the lease
//!   expires, and every later transition is fenced by that worker
//! - Failed attempts are requeued with capped exponential backoff plus jitter
//! - Exhausted or unrecoverable jobs end in `deadletter` with `last_error`
//! - One `RunSummary` per finished attempt
//!
//! ## Components
//!
//! - `Job` / `NewJob`: job record and producer input
//! - `JobQueue`: queue abstraction (`InMemoryJobQueue`, `PostgresJobQueue`)
//! - `JobPayload`: typed payload decoding and lock keys
//! - `HandlerRegistry`: `JobType` → planner dispatch
//! - `JobExecutor`: worker loop with locking, retry and panic isolation

pub mod executor;
pub mod handlers;
pub mod payload;
pub mod postgres;
pub mod store;
pub mod types;

pub use executor::{
    ExecutorConfig, ExecutorError, ExecutorStats, JobExecutor, JobExecutorHandle, JobOutcome,
};
pub use handlers::{
    DEFAULT_PLAN_CHUNK, HandlerContext, HandlerError, HandlerRegistry, JobHandler, MergeHandler,
    SplitHandler,
};
pub use payload::{
    AddEntityPayload, AuditPayload, JobPayload, MergePayload, SplitPayload, TargetedFixPayload,
};
pub use postgres::PostgresJobQueue;
pub use store::{InMemoryJobQueue, JobQueue, JobQueueError, JobStats, QueueConfig};
pub use types::{Job, JobId, JobStatus, JobType, NewJob, RetryPolicy, RunReport, RunSummary};
