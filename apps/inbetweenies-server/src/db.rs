//! Database bootstrap: pool creation plus hydrating the in-memory
//! tombstone log from the persisted `tombstones` table on startup.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use inbetweenies_core::delta::TombstoneLog;

pub async fn create_pool(url: &str) -> anyhow::Result<SqlitePool> {
    let path = url.strip_prefix("sqlite:").unwrap_or(url);
    inbetweenies_store::create_pool(path).await.map_err(Into::into)
}

#[derive(sqlx::FromRow)]
struct TombstoneRow {
    entity_id: String,
    deleted_at: DateTime<Utc>,
    deleted_by: Option<String>,
}

pub async fn load_tombstones(pool: &SqlitePool) -> anyhow::Result<TombstoneLog> {
    let rows: Vec<TombstoneRow> =
        sqlx::query_as("SELECT entity_id, deleted_at, deleted_by FROM tombstones")
            .fetch_all(pool)
            .await?;

    let mut log = TombstoneLog::new();
    for row in rows {
        let id = uuid::Uuid::parse_str(&row.entity_id)?;
        log.record(id, row.deleted_by.unwrap_or_default(), row.deleted_at);
    }
    Ok(log)
}
