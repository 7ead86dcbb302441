//! Postgres-backed catalog store.

use serde_json::{Map, Value};
use sqlx::Row;
use tracing::instrument;

use catalogops_core::{EntityId, FamilyId};

use super::store::{CatalogEntity, CatalogError, CatalogReader, CatalogStore};
use crate::db::{PgBackend, describe_sqlx_error};

#[derive(Debug, Clone)]
pub struct PostgresCatalogStore {
    backend: PgBackend,
}

impl PostgresCatalogStore {
    pub fn new(backend: PgBackend) -> Self {
        Self { backend }
    }

    pub async fn load_entity(&self, id: &EntityId) -> Result<Option<CatalogEntity>, CatalogError> {
        let row = sqlx::query(
            "SELECT id, family_id, attributes, updated_at FROM catalog_entities WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(self.backend.pool())
        .await
        .map_err(|e| map_sqlx_error("load_entity", e))?;

        row.as_ref().map(entity_from_row).transpose()
    }

    pub async fn load_family(
        &self,
        family_id: &FamilyId,
    ) -> Result<Vec<CatalogEntity>, CatalogError> {
        let rows = sqlx::query(
            r#"
            SELECT id, family_id, attributes, updated_at
            FROM catalog_entities
            WHERE family_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(family_id.as_str())
        .fetch_all(self.backend.pool())
        .await
        .map_err(|e| map_sqlx_error("load_family", e))?;

        rows.iter().map(entity_from_row).collect()
    }

    #[instrument(skip(self, entity), fields(entity_id = %entity.id, family_id = %entity.family_id), err)]
    pub async fn upsert_entity(&self, entity: &CatalogEntity) -> Result<(), CatalogError> {
        sqlx::query(
            r#"
            INSERT INTO catalog_entities (id, family_id, attributes, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (id) DO UPDATE
            SET family_id = EXCLUDED.family_id,
                attributes = EXCLUDED.attributes,
                updated_at = NOW()
            "#,
        )
        .bind(entity.id.as_str())
        .bind(entity.family_id.as_str())
        .bind(Value::Object(entity.attributes.clone()))
        .execute(self.backend.pool())
        .await
        .map_err(|e| map_sqlx_error("upsert_entity", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(entity_id = %id), err)]
    pub async fn delete_entity(&self, id: &EntityId) -> Result<bool, CatalogError> {
        let result = sqlx::query("DELETE FROM catalog_entities WHERE id = $1")
            .bind(id.as_str())
            .execute(self.backend.pool())
            .await
            .map_err(|e| map_sqlx_error("delete_entity", e))?;
        Ok(result.rows_affected() > 0)
    }
}

impl CatalogReader for PostgresCatalogStore {
    fn get(&self, id: &EntityId) -> Result<Option<CatalogEntity>, CatalogError> {
        self.backend.block_on(self.load_entity(id))
    }

    fn list_family(&self, family_id: &FamilyId) -> Result<Vec<CatalogEntity>, CatalogError> {
        self.backend.block_on(self.load_family(family_id))
    }
}

impl CatalogStore for PostgresCatalogStore {
    fn put(&self, entity: CatalogEntity) -> Result<(), CatalogError> {
        self.backend.block_on(self.upsert_entity(&entity))
    }

    fn delete(&self, id: &EntityId) -> Result<bool, CatalogError> {
        self.backend.block_on(self.delete_entity(id))
    }

    fn as_reader(&self) -> &dyn CatalogReader {
        self
    }
}

fn entity_from_row(row: &sqlx::postgres::PgRow) -> Result<CatalogEntity, CatalogError> {
    let read = |e: sqlx::Error| CatalogError::Storage(format!("failed to read entity row: {e}"));
    let id: String = row.try_get("id").map_err(read)?;
    let family_id: String = row.try_get("family_id").map_err(read)?;
    let attributes: Value = row.try_get("attributes").map_err(read)?;

    let attributes = match attributes {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(CatalogError::Storage(format!(
                "entity {id} has non-object attributes: {other}"
            )));
        }
    };

    Ok(CatalogEntity {
        id: EntityId::from(id.as_str()),
        family_id: FamilyId::from(family_id.as_str()),
        attributes,
        updated_at: row.try_get("updated_at").map_err(read)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CatalogError {
    CatalogError::Storage(describe_sqlx_error(operation, &err))
}
