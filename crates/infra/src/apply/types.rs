//! Change plans, journal records and apply outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use catalogops_core::{ChangeRecordId, EntityId, JobId};

use crate::catalog::CatalogEntity;

/// Whether the engine mutates or only previews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    DryRun,
    Apply,
}

impl ApplyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyMode::DryRun => "dry_run",
            ApplyMode::Apply => "apply",
        }
    }
}

impl std::fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Before/after snapshot of one target. `None` means the entity does not exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    pub entity_id: EntityId,
    pub before: Option<CatalogEntity>,
    pub after: Option<CatalogEntity>,
}

/// A proposed mutation produced by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePlan {
    pub job_id: JobId,
    pub operation_type: String,
    pub changes: Vec<EntityChange>,
    /// Caller-supplied key; derived from the plan when absent.
    pub idempotency_key: Option<String>,
}

impl ChangePlan {
    pub fn new(job_id: JobId, operation_type: impl Into<String>) -> Self {
        Self {
            job_id,
            operation_type: operation_type.into(),
            changes: Vec::new(),
            idempotency_key: None,
        }
    }

    pub fn with_change(
        mut self,
        entity_id: EntityId,
        before: Option<CatalogEntity>,
        after: Option<CatalogEntity>,
    ) -> Self {
        self.changes.push(EntityChange {
            entity_id,
            before,
            after,
        });
        self
    }

    pub fn with_idempotency_key(mut self, key: impl std::fmt::Display) -> Self {
        self.idempotency_key = Some(key.to_string());
        self
    }

    /// Targets in plan order.
    pub fn targets(&self) -> Vec<EntityId> {
        self.changes.iter().map(|c| c.entity_id.clone()).collect()
    }

    pub fn resolve_key(&self) -> IdempotencyKey {
        match &self.idempotency_key {
            Some(key) => IdempotencyKey(key.clone()),
            None => IdempotencyKey::derive(self.job_id, &self.operation_type, &self.targets()),
        }
    }
}

/// Guards a plan against being applied twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Hex SHA-256 over the job, the operation and the ordered targets.
    pub fn derive(job_id: JobId, operation_type: &str, targets: &[EntityId]) -> Self {
        Self::hash(job_id, operation_type, targets.iter().map(EntityId::as_str))
    }

    /// Key for a plan whose target set is only known at run time (merge,
    /// split): scoped to the job, the operation and the families involved
    /// rather than the entities, so a retry maps to the same record.
    pub fn scoped(job_id: JobId, operation_type: &str, scope: &[&str]) -> Self {
        Self::hash(job_id, operation_type, scope.iter().copied())
    }

    fn hash<'a>(job_id: JobId, operation_type: &str, parts: impl Iterator<Item = &'a str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(job_id.as_uuid().as_bytes());
        hasher.update([0u8]);
        hasher.update(operation_type.as_bytes());
        for part in parts {
            hasher.update([0u8]);
            hasher.update(part.as_bytes());
        }
        let digest = hasher.finalize();
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Claimed key. Never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
}

/// Append-only journal entry.
///
/// `before` and `after` are JSON objects keyed by target id; a `null` value
/// means the entity did not exist on that side of the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ChangeRecordId,
    pub job_id: JobId,
    pub idempotency_key: IdempotencyKey,
    pub operation_type: String,
    pub targets: Vec<EntityId>,
    pub before: Value,
    pub after: Value,
    pub applied_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn from_plan(
        plan: &ChangePlan,
        key: IdempotencyKey,
        applied_at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let mut before = Map::new();
        let mut after = Map::new();
        for change in &plan.changes {
            let id = change.entity_id.to_string();
            before.insert(id.clone(), serde_json::to_value(&change.before)?);
            after.insert(id, serde_json::to_value(&change.after)?);
        }

        Ok(Self {
            id: ChangeRecordId::new(),
            job_id: plan.job_id,
            idempotency_key: key,
            operation_type: plan.operation_type.clone(),
            targets: plan.targets(),
            before: Value::Object(before),
            after: Value::Object(after),
            applied_at,
        })
    }

    /// Per-target snapshots, in target order.
    pub fn changes(&self) -> Result<Vec<EntityChange>, serde_json::Error> {
        self.targets
            .iter()
            .map(|id| {
                let key = id.as_str();
                Ok(EntityChange {
                    entity_id: id.clone(),
                    before: snapshot_at(&self.before, key)?,
                    after: snapshot_at(&self.after, key)?,
                })
            })
            .collect()
    }
}

fn snapshot_at(side: &Value, key: &str) -> Result<Option<CatalogEntity>, serde_json::Error> {
    match side.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone()).map(Some),
    }
}

/// Outcome of `ApplyEngine::apply`.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    /// Rejected by the validator; never retried.
    ValidationFailed { reasons: Vec<String> },
    /// The key was already claimed. `resumed` counts targets brought up to
    /// their journaled `after` snapshot by this call.
    AlreadyApplied {
        change_record_id: Option<ChangeRecordId>,
        resumed: usize,
    },
    /// Dry run: what would be applied.
    Preview {
        idempotency_key: IdempotencyKey,
        changes: Vec<EntityChange>,
    },
    Applied {
        change_record_id: ChangeRecordId,
        operations: usize,
    },
}

impl ApplyResult {
    /// Target writes performed by this call.
    pub fn operations_applied(&self) -> usize {
        match self {
            ApplyResult::Applied { operations, .. } => *operations,
            ApplyResult::AlreadyApplied { resumed, .. } => *resumed,
            ApplyResult::ValidationFailed { .. } | ApplyResult::Preview { .. } => 0,
        }
    }
}
