//! Job handlers: one planner per `JobType`.
//!
//! A handler reads the catalog and returns the `ChangePlan`s it wants
//! applied. It never writes; the executor runs every plan through the
//! `ApplyEngine` in the job's effective mode.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::payload::{
    AddEntityPayload, AuditPayload, JobPayload, MergePayload, SplitPayload, TargetedFixPayload,
};
use super::types::{Job, JobType};
use crate::apply::{ApplyMode, ChangePlan, IdempotencyKey};
use crate::catalog::{CatalogEntity, CatalogError, CatalogReader};
use catalogops_core::EntityId;

/// Everything a handler gets to see.
pub struct HandlerContext<'a> {
    pub job: &'a Job,
    pub payload: &'a JobPayload,
    pub mode: ApplyMode,
    pub catalog: &'a dyn CatalogReader,
}

/// Handler error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The job can never succeed as written; it is dead-lettered.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Transient failure; the job is retried.
    #[error("handler failed: {0}")]
    Failed(String),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl HandlerError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Rejected(_))
    }
}

pub trait JobHandler: Send + Sync {
    fn plan(&self, ctx: &HandlerContext<'_>) -> Result<Vec<ChangePlan>, HandlerError>;
}

impl<F> JobHandler for F
where
    F: Fn(&HandlerContext<'_>) -> Result<Vec<ChangePlan>, HandlerError> + Send + Sync,
{
    fn plan(&self, ctx: &HandlerContext<'_>) -> Result<Vec<ChangePlan>, HandlerError> {
        self(ctx)
    }
}

/// `JobType` → handler dispatch table, filled at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in catalog handlers for every job type.
    pub fn catalog_defaults() -> Self {
        Self::catalog_with_chunk_size(DEFAULT_PLAN_CHUNK)
    }

    /// Built-in handlers with bulk jobs planned `chunk_size` targets at a time.
    pub fn catalog_with_chunk_size(chunk_size: usize) -> Self {
        let mut registry = Self::new();
        registry.register(JobType::TargetedFix, TargetedFixHandler);
        registry.register(JobType::AddEntity, AddEntityHandler);
        registry.register(JobType::Audit, AuditHandler);
        registry.register(JobType::Merge, MergeHandler::with_chunk_size(chunk_size));
        registry.register(JobType::Split, SplitHandler::with_chunk_size(chunk_size));
        registry
    }

    /// Register (or replace) the handler for `job_type`.
    pub fn register<H>(&mut self, job_type: JobType, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(job_type, Arc::new(handler));
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }
}

fn payload_mismatch(ctx: &HandlerContext<'_>) -> HandlerError {
    HandlerError::rejected(format!(
        "{} handler received a {} payload",
        ctx.job.job_type,
        ctx.payload.job_type()
    ))
}

/// Overwrite fields on one existing entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetedFixHandler;

impl JobHandler for TargetedFixHandler {
    fn plan(&self, ctx: &HandlerContext<'_>) -> Result<Vec<ChangePlan>, HandlerError> {
        let JobPayload::TargetedFix(TargetedFixPayload {
            family_id,
            entity_id,
            fields,
        }) = ctx.payload
        else {
            return Err(payload_mismatch(ctx));
        };

        let current = ctx
            .catalog
            .get(entity_id)?
            .ok_or_else(|| HandlerError::rejected(format!("entity {entity_id} does not exist")))?;
        if &current.family_id != family_id {
            return Err(HandlerError::rejected(format!(
                "entity {entity_id} belongs to family {}, not {family_id}",
                current.family_id
            )));
        }

        let mut after = current.clone();
        for (name, value) in fields {
            after.attributes.insert(name.clone(), value.clone());
        }

        Ok(vec![ChangePlan::new(ctx.job.id, JobType::TargetedFix.as_str()).with_change(
            entity_id.clone(),
            Some(current),
            Some(after),
        )])
    }
}

/// Create a new entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddEntityHandler;

impl JobHandler for AddEntityHandler {
    fn plan(&self, ctx: &HandlerContext<'_>) -> Result<Vec<ChangePlan>, HandlerError> {
        let JobPayload::AddEntity(AddEntityPayload {
            family_id,
            entity_id,
            attributes,
        }) = ctx.payload
        else {
            return Err(payload_mismatch(ctx));
        };

        let entity = CatalogEntity::new(entity_id.clone(), family_id.clone(), attributes.clone());
        // An identical entity is what a previous attempt of this job left behind.
        let existing = ctx.catalog.get(entity_id)?;
        if existing.is_some_and(|e| !e.same_content(&entity)) {
            return Err(HandlerError::rejected(format!(
                "entity {entity_id} already exists"
            )));
        }

        Ok(vec![ChangePlan::new(ctx.job.id, JobType::AddEntity.as_str()).with_change(
            entity_id.clone(),
            None,
            Some(entity),
        )])
    }
}

/// Read-only completeness check. Logs findings and plans nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditHandler;

impl JobHandler for AuditHandler {
    fn plan(&self, ctx: &HandlerContext<'_>) -> Result<Vec<ChangePlan>, HandlerError> {
        let JobPayload::Audit(AuditPayload {
            family_id,
            required_fields,
        }) = ctx.payload
        else {
            return Err(payload_mismatch(ctx));
        };

        let entities = ctx.catalog.list_family(family_id)?;
        let mut incomplete = 0usize;
        for entity in &entities {
            let missing = entity.missing_attributes(required_fields);
            if !missing.is_empty() {
                incomplete += 1;
                info!(
                    job_id = %ctx.job.id,
                    family_id = %family_id,
                    entity_id = %entity.id,
                    missing = ?missing,
                    "audit: entity is missing required fields"
                );
            }
        }

        info!(
            job_id = %ctx.job.id,
            family_id = %family_id,
            entities = entities.len(),
            incomplete,
            "audit finished"
        );
        Ok(Vec::new())
    }
}

/// Targets per plan for the bulk handlers.
pub const DEFAULT_PLAN_CHUNK: usize = 250;

/// Move every entity of the source family into the target family.
///
/// Entities are planned in windows of `chunk_size` over the sorted ids of
/// both families, one plan and one scoped key per window. Moved entities stay
/// in their window, so a retry rebuilds the same windows and resumes each one
/// from its journaled record.
#[derive(Debug, Clone, Copy)]
pub struct MergeHandler {
    chunk_size: usize,
}

impl Default for MergeHandler {
    fn default() -> Self {
        Self::with_chunk_size(DEFAULT_PLAN_CHUNK)
    }
}

impl MergeHandler {
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl JobHandler for MergeHandler {
    fn plan(&self, ctx: &HandlerContext<'_>) -> Result<Vec<ChangePlan>, HandlerError> {
        let JobPayload::Merge(MergePayload {
            source_family_id,
            target_family_id,
        }) = ctx.payload
        else {
            return Err(payload_mismatch(ctx));
        };

        let moving = ctx.catalog.list_family(source_family_id)?;
        if moving.is_empty() {
            return Ok(Vec::new());
        }
        let mut window_ids: Vec<EntityId> = moving
            .iter()
            .map(|e| e.id.clone())
            .chain(ctx.catalog.list_family(target_family_id)?.into_iter().map(|e| e.id))
            .collect();
        window_ids.sort();
        window_ids.dedup();

        let mut moving: HashMap<EntityId, CatalogEntity> =
            moving.into_iter().map(|e| (e.id.clone(), e)).collect();
        let operation = JobType::Merge.as_str();
        let mut plans = Vec::new();
        for (index, window) in window_ids.chunks(self.chunk_size).enumerate() {
            let plan = window
                .iter()
                .filter_map(|id| moving.remove(id))
                .fold(ChangePlan::new(ctx.job.id, operation), |plan, entity| {
                    let mut moved = entity.clone();
                    moved.family_id = target_family_id.clone();
                    plan.with_change(entity.id.clone(), Some(entity), Some(moved))
                });
            if plan.changes.is_empty() {
                continue;
            }
            let key = IdempotencyKey::scoped(
                ctx.job.id,
                operation,
                &[
                    source_family_id.as_str(),
                    target_family_id.as_str(),
                    index.to_string().as_str(),
                ],
            );
            plans.push(plan.with_idempotency_key(key));
        }

        Ok(plans)
    }
}

/// Move the listed entities into a new family, `chunk_size` listed ids per plan.
#[derive(Debug, Clone, Copy)]
pub struct SplitHandler {
    chunk_size: usize,
}

impl Default for SplitHandler {
    fn default() -> Self {
        Self::with_chunk_size(DEFAULT_PLAN_CHUNK)
    }
}

impl SplitHandler {
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl JobHandler for SplitHandler {
    fn plan(&self, ctx: &HandlerContext<'_>) -> Result<Vec<ChangePlan>, HandlerError> {
        let JobPayload::Split(SplitPayload {
            family_id,
            new_family_id,
            entity_ids,
        }) = ctx.payload
        else {
            return Err(payload_mismatch(ctx));
        };

        let operation = JobType::Split.as_str();
        let mut plans = Vec::new();
        for (index, chunk) in entity_ids.chunks(self.chunk_size).enumerate() {
            let mut plan = ChangePlan::new(ctx.job.id, operation);
            for entity_id in chunk {
                let entity = ctx.catalog.get(entity_id)?.ok_or_else(|| {
                    HandlerError::rejected(format!("entity {entity_id} does not exist"))
                })?;

                if &entity.family_id == new_family_id {
                    // Moved by an earlier attempt.
                    continue;
                }
                if &entity.family_id != family_id {
                    return Err(HandlerError::rejected(format!(
                        "entity {entity_id} belongs to family {}, not {family_id}",
                        entity.family_id
                    )));
                }

                let mut moved = entity.clone();
                moved.family_id = new_family_id.clone();
                plan = plan.with_change(entity_id.clone(), Some(entity), Some(moved));
            }

            if plan.changes.is_empty() {
                continue;
            }
            let key = IdempotencyKey::scoped(
                ctx.job.id,
                operation,
                &[family_id.as_str(), new_family_id.as_str(), index.to_string().as_str()],
            );
            plans.push(plan.with_idempotency_key(key));
        }

        Ok(plans)
    }
}
