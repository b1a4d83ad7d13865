//! Handler catalog repository.

use chrono::{DateTime, Utc};
use fleet_core::{HandlerDefinition, HandlerId};
use serde::{Deserialize, Serialize};
use surrealdb::RecordId;

use crate::{Database, DbError};

const TABLE: &str = "handler";

/// A persisted handler definition and whether it is enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub definition: HandlerDefinition,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// Internal record type for SurrealDB.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogRecord {
    #[serde(default, skip_serializing)]
    id: Option<RecordId>,
    definition: HandlerDefinition,
    enabled: bool,
    updated_at: DateTime<Utc>,
}

impl From<CatalogRecord> for CatalogEntry {
    fn from(record: CatalogRecord) -> Self {
        Self {
            definition: record.definition,
            enabled: record.enabled,
            updated_at: record.updated_at,
        }
    }
}

/// Repository for the handler catalog.
#[derive(Clone)]
pub struct HandlerRepository {
    db: Database,
}

impl HandlerRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace the record for `definition`.
    pub async fn upsert(
        &self,
        definition: &HandlerDefinition,
        enabled: bool,
    ) -> Result<CatalogEntry, DbError> {
        let content = CatalogRecord {
            id: None,
            definition: definition.clone(),
            enabled,
            updated_at: Utc::now(),
        };

        let record: Option<CatalogRecord> = self
            .db
            .upsert((TABLE, definition.id.to_string()))
            .content(content)
            .await?;

        record
            .map(CatalogEntry::from)
            .ok_or_else(|| DbError::Query(format!("Failed to store handler {}", definition.id)))
    }

    /// Get a catalog entry by handler ID.
    pub async fn get(&self, id: HandlerId) -> Result<CatalogEntry, DbError> {
        let record: Option<CatalogRecord> = self.db.select((TABLE, id.to_string())).await?;

        record
            .map(CatalogEntry::from)
            .ok_or_else(|| DbError::NotFound(format!("Handler not found: {}", id)))
    }

    /// List the whole catalog, oldest first.
    pub async fn list(&self) -> Result<Vec<CatalogEntry>, DbError> {
        let mut records: Vec<CatalogRecord> = self.db.select(TABLE).await?;
        records.sort_by(|a, b| a.definition.id.0.cmp(&b.definition.id.0));
        Ok(records.into_iter().map(CatalogEntry::from).collect())
    }

    /// Flip the enabled flag of an existing entry.
    pub async fn set_enabled(&self, id: HandlerId, enabled: bool) -> Result<CatalogEntry, DbError> {
        let mut result = self
            .db
            .query("UPDATE type::thing($table, $id) SET enabled = $enabled, updated_at = $now RETURN AFTER")
            .bind(("table", TABLE))
            .bind(("id", id.to_string()))
            .bind(("enabled", enabled))
            .bind(("now", Utc::now()))
            .await?;

        let records: Vec<CatalogRecord> = result.take(0)?;

        records
            .into_iter()
            .next()
            .map(CatalogEntry::from)
            .ok_or_else(|| DbError::NotFound(format!("Handler not found: {}", id)))
    }

    /// Delete an entry. Deleting a missing entry is not an error.
    pub async fn delete(&self, id: HandlerId) -> Result<(), DbError> {
        let _: Option<CatalogRecord> = self.db.delete((TABLE, id.to_string())).await?;
        Ok(())
    }
}
