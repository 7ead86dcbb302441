//! Idempotent apply with an append-only journal.
//!
//! ## Flow
//!
//! 1. Validate the plan (`PlanValidator`); a rejection is final
//! 2. Resolve the idempotency key; an already-claimed key short-circuits
//! 3. Dry run stops here with a preview
//! 4. Claim the key and append the `ChangeRecord` in one atomic step
//! 5. Write each target's `after` snapshot to the catalog
//!
//! A retry after a crash between 4 and 5 finds the key claimed and resumes
//! the targets still at their `before` snapshot.

pub mod engine;
pub mod journal;
pub mod postgres;
pub mod types;
pub mod validation;

pub use engine::{ApplyEngine, ApplyError};
pub use journal::{InMemoryJournal, JournalError, JournalStore, RecordOutcome};
pub use postgres::PostgresJournal;
pub use types::{
    ApplyMode, ApplyResult, ChangePlan, ChangeRecord, EntityChange, IdempotencyKey,
    IdempotencyRecord,
};
pub use validation::{PlanValidator, RuleValidator, ValidationOutcome};
