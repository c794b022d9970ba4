//! Database schema initialization.

use sqlx::SqlitePool;

use crate::error::Result;

/// Create tables and indexes if they don't already exist.
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_TABLES_SQL).execute(pool).await?;
    sqlx::query(SCHEMA_INDEXES_SQL).execute(pool).await?;
    Ok(())
}

const SCHEMA_TABLES_SQL: &str = r#"
-- Every version of every entity. (id, version) is the natural key; rows are
-- never updated or deleted, only superseded by a newer version.
CREATE TABLE IF NOT EXISTS entities (
    id TEXT NOT NULL,
    version TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    name TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '{}',
    source_type TEXT NOT NULL,
    user_id TEXT,
    parent_versions TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (id, version)
);

-- A directed, typed edge anchored at specific entity versions.
CREATE TABLE IF NOT EXISTS relationships (
    id TEXT PRIMARY KEY,
    from_entity_id TEXT NOT NULL,
    from_entity_version TEXT NOT NULL,
    to_entity_id TEXT NOT NULL,
    to_entity_version TEXT NOT NULL,
    relationship_type TEXT NOT NULL,
    properties TEXT NOT NULL DEFAULT '{}',
    user_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Deletion propagation log (entity_id, not (id, version) — deleting retires
-- the whole entity, not a single version).
CREATE TABLE IF NOT EXISTS tombstones (
    entity_id TEXT PRIMARY KEY,
    deleted_at TEXT NOT NULL,
    deleted_by TEXT
);
"#;

const SCHEMA_INDEXES_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_entities_id ON entities(id);
CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type);
CREATE INDEX IF NOT EXISTS idx_entities_updated_at ON entities(updated_at);

CREATE INDEX IF NOT EXISTS idx_relationships_from ON relationships(from_entity_id);
CREATE INDEX IF NOT EXISTS idx_relationships_to ON relationships(to_entity_id);
CREATE INDEX IF NOT EXISTS idx_relationships_type ON relationships(relationship_type);

CREATE INDEX IF NOT EXISTS idx_tombstones_deleted_at ON tombstones(deleted_at);
"#;
