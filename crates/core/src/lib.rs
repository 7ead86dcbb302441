//! `catalogops-core`: orchestration building blocks.
//!
//! This crate contains **pure** primitives (no storage or runtime concerns):
//! typed identifiers, the domain error model and the clock abstraction every
//! lease and lock comparison goes through.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{ChangeRecordId, EntityId, FamilyId, JobId, WorkerId};
