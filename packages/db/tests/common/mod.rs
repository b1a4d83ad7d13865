use db::{Database, DbConfig, DbError};

/// A fresh in-memory catalog with the schema applied.
pub async fn setup_db() -> Result<Database, DbError> {
    db::init(DbConfig::memory()).await
}
