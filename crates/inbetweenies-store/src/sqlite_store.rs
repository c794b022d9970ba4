//! `SqliteGraphStore`: the server-side `GraphCrud`/`GraphSearch`/
//! `GraphTraversal` backend.

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use inbetweenies_core::models::{Entity, EntityRelationship, EntityType, RelationshipType, SourceType};
use inbetweenies_core::search::{self, SearchResult};
use inbetweenies_core::store::{GraphCrud, GraphSearch, GraphTraversal, StoreResult, Subgraph};

use crate::error::{Result, StoreError};

pub struct SqliteGraphStore {
    pool: SqlitePool,
}

impl SqliteGraphStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct EntityRow {
    id: String,
    version: String,
    entity_type: String,
    name: String,
    content: String,
    source_type: String,
    user_id: Option<String>,
    parent_versions: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EntityRow {
    fn into_entity(self) -> Result<Entity> {
        Ok(Entity {
            id: parse_uuid(&self.id)?,
            version: self.version,
            entity_type: EntityType::from_str(&self.entity_type)?,
            name: self.name,
            content: serde_json::from_str(&self.content)?,
            source_type: source_type_from_str(&self.source_type)?,
            user_id: self.user_id,
            parent_versions: serde_json::from_str(&self.parent_versions)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn source_type_from_str(s: &str) -> Result<SourceType> {
    Ok(match s {
        "homekit" => SourceType::Homekit,
        "matter" => SourceType::Matter,
        "manual" => SourceType::Manual,
        "imported" => SourceType::Imported,
        "generated" => SourceType::Generated,
        other => {
            return Err(StoreError::Core(inbetweenies_core::CoreError::Validation(
                format!("unknown source_type: {other}"),
            )))
        }
    })
}

fn source_type_as_str(s: SourceType) -> &'static str {
    match s {
        SourceType::Homekit => "homekit",
        SourceType::Matter => "matter",
        SourceType::Manual => "manual",
        SourceType::Imported => "imported",
        SourceType::Generated => "generated",
    }
}

#[derive(FromRow)]
struct RelationshipRow {
    id: String,
    from_entity_id: String,
    from_entity_version: String,
    to_entity_id: String,
    to_entity_version: String,
    relationship_type: String,
    properties: String,
    user_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RelationshipRow {
    fn into_relationship(self) -> Result<EntityRelationship> {
        Ok(EntityRelationship {
            id: parse_uuid(&self.id)?,
            from_entity_id: parse_uuid(&self.from_entity_id)?,
            from_entity_version: self.from_entity_version,
            to_entity_id: parse_uuid(&self.to_entity_id)?,
            to_entity_version: self.to_entity_version,
            relationship_type: RelationshipType::from_str(&self.relationship_type)?,
            properties: serde_json::from_str(&self.properties)?,
            user_id: self.user_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        StoreError::Core(inbetweenies_core::CoreError::Validation(format!(
            "invalid uuid {s}: {e}"
        )))
    })
}

impl SqliteGraphStore {
    async fn latest_entities(
        &self,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<Entity>> {
        let rows: Vec<EntityRow> = match entity_type {
            Some(t) => {
                sqlx::query_as(
                    r#"
                    SELECT e.* FROM entities e
                    INNER JOIN (
                        SELECT id, MAX(created_at) AS max_created
                        FROM entities WHERE entity_type = ?
                        GROUP BY id
                    ) latest ON e.id = latest.id AND e.created_at = latest.max_created
                    LEFT JOIN tombstones t ON t.entity_id = e.id
                    WHERE e.entity_type = ? AND t.entity_id IS NULL
                    "#,
                )
                .bind(t.as_str())
                .bind(t.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT e.* FROM entities e
                    INNER JOIN (
                        SELECT id, MAX(created_at) AS max_created
                        FROM entities GROUP BY id
                    ) latest ON e.id = latest.id AND e.created_at = latest.max_created
                    LEFT JOIN tombstones t ON t.entity_id = e.id
                    WHERE t.entity_id IS NULL
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(EntityRow::into_entity).collect()
    }
}

#[async_trait]
impl GraphCrud for SqliteGraphStore {
    async fn store_entity(&self, entity: Entity) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO entities
                (id, version, entity_type, name, content, source_type, user_id, parent_versions, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entity.id.to_string())
        .bind(&entity.version)
        .bind(entity.entity_type.as_str())
        .bind(&entity.name)
        .bind(serde_json::to_string(&entity.content)?)
        .bind(source_type_as_str(entity.source_type))
        .bind(&entity.user_id)
        .bind(serde_json::to_string(&entity.parent_versions)?)
        .bind(entity.created_at)
        .bind(entity.updated_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn get_entity(&self, id: Uuid, version: Option<&str>) -> StoreResult<Option<Entity>> {
        let row: Option<EntityRow> = match version {
            // An explicit version is a history lookup: tombstoning an entity
            // doesn't erase its past versions.
            Some(v) => sqlx::query_as("SELECT * FROM entities WHERE id = ? AND version = ?")
                .bind(id.to_string())
                .bind(v)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from)?,
            None => sqlx::query_as(
                r#"
                SELECT e.* FROM entities e
                LEFT JOIN tombstones t ON t.entity_id = e.id
                WHERE e.id = ? AND t.entity_id IS NULL
                ORDER BY e.created_at DESC LIMIT 1
                "#,
            )
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?,
        };

        Ok(match row {
            Some(r) => Some(r.into_entity().map_err(anyhow::Error::from)?),
            None => None,
        })
    }

    async fn get_entity_versions(&self, id: Uuid) -> StoreResult<Vec<Entity>> {
        let rows: Vec<EntityRow> =
            sqlx::query_as("SELECT * FROM entities WHERE id = ? ORDER BY created_at ASC")
                .bind(id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(EntityRow::into_entity)
            .collect::<Result<Vec<_>>>()
            .map_err(anyhow::Error::from)?)
    }

    async fn get_entities_by_type(&self, entity_type: EntityType) -> StoreResult<Vec<Entity>> {
        Ok(self
            .latest_entities(Some(entity_type))
            .await
            .map_err(anyhow::Error::from)?)
    }

    async fn delete_entity(&self, id: Uuid, deleted_by: &str, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO tombstones (entity_id, deleted_at, deleted_by) VALUES (?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(now)
        .bind(deleted_by)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn store_relationship(&self, relationship: EntityRelationship) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO relationships
                (id, from_entity_id, from_entity_version, to_entity_id, to_entity_version,
                 relationship_type, properties, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(relationship.id.to_string())
        .bind(relationship.from_entity_id.to_string())
        .bind(&relationship.from_entity_version)
        .bind(relationship.to_entity_id.to_string())
        .bind(&relationship.to_entity_version)
        .bind(relationship.relationship_type.as_str())
        .bind(serde_json::to_string(&relationship.properties)?)
        .bind(&relationship.user_id)
        .bind(relationship.created_at)
        .bind(relationship.updated_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn get_relationships(
        &self,
        from: Option<Uuid>,
        to: Option<Uuid>,
        relationship_type: Option<RelationshipType>,
    ) -> StoreResult<Vec<EntityRelationship>> {
        let mut sql = String::from("SELECT * FROM relationships WHERE 1 = 1");
        if from.is_some() {
            sql.push_str(" AND from_entity_id = ?");
        }
        if to.is_some() {
            sql.push_str(" AND to_entity_id = ?");
        }
        if relationship_type.is_some() {
            sql.push_str(" AND relationship_type = ?");
        }

        let mut query = sqlx::query_as::<_, RelationshipRow>(&sql);
        if let Some(from) = from {
            query = query.bind(from.to_string());
        }
        if let Some(to) = to {
            query = query.bind(to.to_string());
        }
        if let Some(rt) = relationship_type {
            query = query.bind(rt.as_str());
        }

        let rows = query.fetch_all(&self.pool).await.map_err(StoreError::from)?;
        Ok(rows
            .into_iter()
            .map(RelationshipRow::into_relationship)
            .collect::<Result<Vec<_>>>()
            .map_err(anyhow::Error::from)?)
    }

    async fn get_entities_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Entity>> {
        let all = self.latest_entities(None).await.map_err(anyhow::Error::from)?;
        Ok(all
            .into_iter()
            .filter(|e| e.created_at >= since || e.updated_at >= since)
            .collect())
    }

    async fn clear(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM entities").execute(&self.pool).await.map_err(StoreError::from)?;
        sqlx::query("DELETE FROM relationships").execute(&self.pool).await.map_err(StoreError::from)?;
        sqlx::query("DELETE FROM tombstones").execute(&self.pool).await.map_err(StoreError::from)?;
        Ok(())
    }
}

#[async_trait]
impl GraphSearch for SqliteGraphStore {
    async fn search(
        &self,
        query: &str,
        types: Option<&[EntityType]>,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>> {
        let candidates = match types {
            Some(types) => {
                let mut all = Vec::new();
                for t in types {
                    all.extend(self.latest_entities(Some(*t)).await.map_err(anyhow::Error::from)?);
                }
                all
            }
            None => self.latest_entities(None).await.map_err(anyhow::Error::from)?,
        };

        Ok(search::rank(candidates, query, limit))
    }
}

#[async_trait]
impl GraphTraversal for SqliteGraphStore {
    async fn find_path(&self, from: Uuid, to: Uuid, max_depth: usize) -> StoreResult<Option<Vec<Uuid>>> {
        if from == to {
            return Ok(Some(vec![from]));
        }

        let mut visited = HashSet::new();
        visited.insert(from);
        let mut queue = VecDeque::new();
        queue.push_back(vec![from]);

        while let Some(path) = queue.pop_front() {
            let node = *path.last().unwrap();
            if path.len() - 1 >= max_depth {
                continue;
            }

            let edges = self
                .get_relationships(Some(node), None, None)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;

            for edge in edges {
                if visited.contains(&edge.to_entity_id) {
                    continue;
                }
                let mut next = path.clone();
                next.push(edge.to_entity_id);
                if edge.to_entity_id == to {
                    return Ok(Some(next));
                }
                visited.insert(edge.to_entity_id);
                queue.push_back(next);
            }
        }

        Ok(None)
    }

    async fn get_subgraph(&self, root: Uuid, depth: usize) -> StoreResult<Subgraph> {
        let mut visited = HashSet::new();
        visited.insert(root);
        let mut frontier = vec![root];
        let mut entities = Vec::new();
        let mut relationships = Vec::new();

        if let Some(e) = self.get_entity(root, None).await? {
            entities.push(e);
        }

        for _ in 0..depth {
            let mut next_frontier = Vec::new();
            for node in &frontier {
                let edges = self.get_relationships(Some(*node), None, None).await?;
                for edge in edges {
                    if !visited.contains(&edge.to_entity_id) {
                        visited.insert(edge.to_entity_id);
                        if let Some(e) = self.get_entity(edge.to_entity_id, None).await? {
                            entities.push(e);
                        }
                        next_frontier.push(edge.to_entity_id);
                    }
                    relationships.push(edge);
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        Ok(Subgraph { entities, relationships })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inbetweenies_core::models::SourceType;
    use serde_json::json;

    async fn test_store() -> SqliteGraphStore {
        let pool = crate::pool::create_pool(":memory:").await.unwrap();
        SqliteGraphStore::new(pool)
    }

    fn device(name: &str) -> Entity {
        let now = Utc::now();
        Entity::create(EntityType::Device, name, json!({}), SourceType::Manual, "alice", now).unwrap()
    }

    #[tokio::test]
    async fn store_and_fetch_latest_entity() {
        let store = test_store().await;
        let e = device("Lamp");
        store.store_entity(e.clone()).await.unwrap();

        let fetched = store.get_entity(e.id, None).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Lamp");
    }

    #[tokio::test]
    async fn get_entities_by_type_returns_only_latest_version() {
        let store = test_store().await;
        let e = device("Lamp");
        store.store_entity(e.clone()).await.unwrap();
        let child = e.create_child("bob", json!({"power": "on"}), None, Utc::now()).unwrap();
        store.store_entity(child.clone()).await.unwrap();

        let latest = store.get_entities_by_type(EntityType::Device).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, child.version);
    }

    #[tokio::test]
    async fn deleted_entity_is_absent_from_latest_lookups_but_keeps_history() {
        let store = test_store().await;
        let e = device("Lamp");
        store.store_entity(e.clone()).await.unwrap();

        store.delete_entity(e.id, "alice", Utc::now()).await.unwrap();

        assert!(store.get_entity(e.id, None).await.unwrap().is_none());
        assert!(store
            .get_entities_by_type(EntityType::Device)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.get_entity(e.id, Some(&e.version)).await.unwrap().unwrap().name,
            "Lamp"
        );
    }

    #[tokio::test]
    async fn find_path_follows_relationships() {
        let store = test_store().await;
        let room = Entity::create(EntityType::Room, "Kitchen", json!({}), SourceType::Manual, "a", Utc::now()).unwrap();
        let device = device("Lamp");
        store.store_entity(room.clone()).await.unwrap();
        store.store_entity(device.clone()).await.unwrap();

        let rel = EntityRelationship::create(
            device.id,
            device.version.clone(),
            EntityType::Device,
            room.id,
            room.version.clone(),
            EntityType::Room,
            RelationshipType::LocatedIn,
            json!({}),
            None,
            Utc::now(),
        )
        .unwrap();
        store.store_relationship(rel).await.unwrap();

        let path = store.find_path(device.id, room.id, 3).await.unwrap();
        assert_eq!(path, Some(vec![device.id, room.id]));
    }
}
