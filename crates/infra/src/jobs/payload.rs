//! Typed job payloads.
//!
//! The queue stores payloads as opaque JSON; they are decoded here, at
//! execution time, into one variant per `JobType`. The families a payload
//! touches determine which resource locks the executor takes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use catalogops_core::{DomainError, DomainResult, EntityId, FamilyId};

use super::types::JobType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetedFixPayload {
    pub family_id: FamilyId,
    pub entity_id: EntityId,
    /// Attribute values to overwrite on the entity
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddEntityPayload {
    pub family_id: FamilyId,
    pub entity_id: EntityId,
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditPayload {
    pub family_id: FamilyId,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePayload {
    pub source_family_id: FamilyId,
    pub target_family_id: FamilyId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPayload {
    pub family_id: FamilyId,
    pub new_family_id: FamilyId,
    pub entity_ids: Vec<EntityId>,
}

/// Decoded payload, one variant per job type.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    TargetedFix(TargetedFixPayload),
    AddEntity(AddEntityPayload),
    Audit(AuditPayload),
    Merge(MergePayload),
    Split(SplitPayload),
}

impl JobPayload {
    /// Decode the stored JSON for `job_type`.
    pub fn decode(job_type: JobType, payload: &Value) -> DomainResult<Self> {
        fn parse<T: for<'de> Deserialize<'de>>(job_type: JobType, payload: &Value) -> DomainResult<T> {
            serde_json::from_value(payload.clone())
                .map_err(|e| DomainError::validation(format!("{job_type} payload: {e}")))
        }

        let decoded = match job_type {
            JobType::TargetedFix => JobPayload::TargetedFix(parse(job_type, payload)?),
            JobType::AddEntity => JobPayload::AddEntity(parse(job_type, payload)?),
            JobType::Audit => JobPayload::Audit(parse(job_type, payload)?),
            JobType::Merge => JobPayload::Merge(parse(job_type, payload)?),
            JobType::Split => JobPayload::Split(parse(job_type, payload)?),
        };
        decoded.check()?;
        Ok(decoded)
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::TargetedFix(_) => JobType::TargetedFix,
            JobPayload::AddEntity(_) => JobType::AddEntity,
            JobPayload::Audit(_) => JobType::Audit,
            JobPayload::Merge(_) => JobType::Merge,
            JobPayload::Split(_) => JobType::Split,
        }
    }

    /// Families the job reads or writes.
    pub fn families(&self) -> Vec<&FamilyId> {
        match self {
            JobPayload::TargetedFix(p) => vec![&p.family_id],
            JobPayload::AddEntity(p) => vec![&p.family_id],
            JobPayload::Audit(p) => vec![&p.family_id],
            JobPayload::Merge(p) => vec![&p.source_family_id, &p.target_family_id],
            JobPayload::Split(p) => vec![&p.family_id, &p.new_family_id],
        }
    }

    /// Lock keys in acquisition order: lexicographic, deduplicated.
    pub fn resource_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.families().into_iter().map(FamilyId::resource_key).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Encode for `NewJob::payload`.
    pub fn to_value(&self) -> Value {
        let encoded = match self {
            JobPayload::TargetedFix(p) => serde_json::to_value(p),
            JobPayload::AddEntity(p) => serde_json::to_value(p),
            JobPayload::Audit(p) => serde_json::to_value(p),
            JobPayload::Merge(p) => serde_json::to_value(p),
            JobPayload::Split(p) => serde_json::to_value(p),
        };
        // Plain structs of strings and JSON maps always serialize.
        encoded.unwrap_or(Value::Null)
    }

    fn check(&self) -> DomainResult<()> {
        for family in self.families() {
            if family.as_str().trim().is_empty() {
                return Err(DomainError::validation("family id must not be empty"));
            }
        }
        match self {
            JobPayload::TargetedFix(p) if p.fields.is_empty() => {
                Err(DomainError::validation("targeted_fix needs at least one field"))
            }
            JobPayload::Merge(p) if p.source_family_id == p.target_family_id => {
                Err(DomainError::validation("merge source and target families must differ"))
            }
            JobPayload::Split(p) if p.family_id == p.new_family_id => {
                Err(DomainError::validation("split must move entities to a different family"))
            }
            JobPayload::Split(p) if p.entity_ids.is_empty() => {
                Err(DomainError::validation("split needs at least one entity"))
            }
            _ => Ok(()),
        }
    }
}
