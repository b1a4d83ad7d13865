//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables, fields, and indexes.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(HANDLER_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Handler catalog schema.
///
/// Definitions are stored whole; settings evolve faster than a rigid
/// schema would allow.
const HANDLER_SCHEMA: &str = r#"
-- Handler catalog: one record per registered handler definition
DEFINE TABLE IF NOT EXISTS handler SCHEMALESS;

DEFINE FIELD IF NOT EXISTS definition ON handler TYPE object;
DEFINE FIELD IF NOT EXISTS enabled ON handler TYPE bool DEFAULT true;
DEFINE FIELD IF NOT EXISTS updated_at ON handler TYPE string;

-- A full name maps to exactly one definition
DEFINE INDEX IF NOT EXISTS handler_full_name ON handler
    FIELDS definition.name.package, definition.name.handler, definition.name.job UNIQUE;
DEFINE INDEX IF NOT EXISTS handler_enabled ON handler FIELDS enabled;
"#;
