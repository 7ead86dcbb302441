//! Catalog entity model and storage traits.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use catalogops_core::{Clock, EntityId, FamilyId, SystemClock};

/// One catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntity {
    pub id: EntityId,
    pub family_id: FamilyId,
    pub attributes: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogEntity {
    pub fn new(id: EntityId, family_id: FamilyId, attributes: Map<String, Value>) -> Self {
        Self {
            id,
            family_id,
            attributes,
            updated_at: Utc::now(),
        }
    }

    /// Same family and attributes, ignoring `updated_at`.
    pub fn same_content(&self, other: &CatalogEntity) -> bool {
        self.id == other.id && self.family_id == other.family_id && self.attributes == other.attributes
    }

    /// Names of `required` attributes that are absent, null or empty strings.
    pub fn missing_attributes<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|name| match self.attributes.get(name.as_str()) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            })
            .map(String::as_str)
            .collect()
    }
}

/// Compare two optional snapshots by content.
pub fn snapshot_matches(current: Option<&CatalogEntity>, snapshot: Option<&CatalogEntity>) -> bool {
    match (current, snapshot) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_content(b),
        _ => false,
    }
}

/// Catalog storage error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("storage error: {0}")]
    Storage(String),
}

/// Read access handed to job handlers.
pub trait CatalogReader: Send + Sync {
    fn get(&self, id: &EntityId) -> Result<Option<CatalogEntity>, CatalogError>;

    /// Entities of a family ordered by id.
    fn list_family(&self, family_id: &FamilyId) -> Result<Vec<CatalogEntity>, CatalogError>;
}

/// Write access, used only by the apply engine.
pub trait CatalogStore: CatalogReader {
    /// Insert or replace an entity.
    fn put(&self, entity: CatalogEntity) -> Result<(), CatalogError>;

    /// Returns false if the entity did not exist.
    fn delete(&self, id: &EntityId) -> Result<bool, CatalogError>;

    /// Make `id` look like `snapshot` (`None` removes it).
    fn write_snapshot(
        &self,
        id: &EntityId,
        snapshot: Option<&CatalogEntity>,
    ) -> Result<(), CatalogError> {
        match snapshot {
            Some(entity) => self.put(entity.clone()),
            None => self.delete(id).map(|_| ()),
        }
    }

    fn as_reader(&self) -> &dyn CatalogReader;
}

/// In-memory catalog for tests/dev.
#[derive(Debug)]
pub struct InMemoryCatalogStore {
    clock: Arc<dyn Clock>,
    entities: RwLock<BTreeMap<EntityId, CatalogEntity>>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entities: RwLock::new(BTreeMap::new()),
        }
    }

    /// Test helper: seed an entity.
    pub fn insert(&self, entity: CatalogEntity) {
        self.entities
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(entity.id.clone(), entity);
    }

    pub fn len(&self) -> usize {
        self.entities.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCatalogStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> CatalogError {
    CatalogError::Storage("catalog lock poisoned".to_string())
}

impl CatalogReader for InMemoryCatalogStore {
    fn get(&self, id: &EntityId) -> Result<Option<CatalogEntity>, CatalogError> {
        Ok(self.entities.read().map_err(|_| poisoned())?.get(id).cloned())
    }

    fn list_family(&self, family_id: &FamilyId) -> Result<Vec<CatalogEntity>, CatalogError> {
        Ok(self
            .entities
            .read()
            .map_err(|_| poisoned())?
            .values()
            .filter(|e| &e.family_id == family_id)
            .cloned()
            .collect())
    }
}

impl CatalogStore for InMemoryCatalogStore {
    fn put(&self, mut entity: CatalogEntity) -> Result<(), CatalogError> {
        entity.updated_at = self.clock.now();
        self.entities
            .write()
            .map_err(|_| poisoned())?
            .insert(entity.id.clone(), entity);
        Ok(())
    }

    fn delete(&self, id: &EntityId) -> Result<bool, CatalogError> {
        Ok(self.entities.write().map_err(|_| poisoned())?.remove(id).is_some())
    }

    fn as_reader(&self) -> &dyn CatalogReader {
        self
    }
}
