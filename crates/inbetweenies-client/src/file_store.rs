//! `FileGraphStore`: the client-side `GraphCrud`/`GraphSearch`/
//! `GraphTraversal` backend. Entities, relationships, and a rebuildable
//! by-type/by-room index are persisted as JSON files under a storage
//! directory, matching a lightweight offline-friendly persistence layer with
//! no embedded database.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use inbetweenies_core::models::{Entity, EntityRelationship, EntityType, RelationshipType};
use inbetweenies_core::search;
use inbetweenies_core::search::SearchResult;
use inbetweenies_core::store::{GraphCrud, GraphSearch, GraphTraversal, StoreResult, Subgraph};

use crate::error::{Result, SyncError};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    by_type: HashMap<String, HashSet<Uuid>>,
    by_room: HashMap<Uuid, HashSet<Uuid>>,
    /// Tombstoned entity ids. Not derivable from `entities.json` alone (no
    /// deletion marker lives on the `Entity` itself), so unlike the rest of
    /// this index it isn't rebuilt from scratch when the file is missing.
    #[serde(default)]
    deleted: HashSet<Uuid>,
}

#[derive(Default)]
struct State {
    entities: HashMap<Uuid, Vec<Entity>>,
    relationships: Vec<EntityRelationship>,
    index: Index,
}

pub struct FileGraphStore {
    dir: PathBuf,
    state: Arc<RwLock<State>>,
}

impl FileGraphStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let state = load(&dir)?;
        Ok(Self {
            dir,
            state: Arc::new(RwLock::new(state)),
        })
    }

    fn entities_path(&self) -> PathBuf {
        self.dir.join("entities.json")
    }

    fn relationships_path(&self) -> PathBuf {
        self.dir.join("relationships.json")
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    fn persist(&self, state: &State) -> Result<()> {
        std::fs::write(
            self.entities_path(),
            serde_json::to_vec_pretty(&state.entities)?,
        )?;
        std::fs::write(
            self.relationships_path(),
            serde_json::to_vec_pretty(&state.relationships)?,
        )?;
        std::fs::write(self.index_path(), serde_json::to_vec_pretty(&state.index)?)?;
        Ok(())
    }
}

fn load(dir: &Path) -> Result<State> {
    let entities: HashMap<Uuid, Vec<Entity>> = read_json(&dir.join("entities.json"))?.unwrap_or_default();
    let relationships: Vec<EntityRelationship> =
        read_json(&dir.join("relationships.json"))?.unwrap_or_default();
    let index = match read_json::<Index>(&dir.join("index.json"))? {
        Some(index) if !index.by_type.is_empty() || !entities.is_empty() => index,
        _ => rebuild_index(&entities, &relationships),
    };

    Ok(State {
        entities,
        relationships,
        index,
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

fn rebuild_index(
    entities: &HashMap<Uuid, Vec<Entity>>,
    relationships: &[EntityRelationship],
) -> Index {
    let mut index = Index::default();
    for versions in entities.values() {
        if let Some(latest) = versions.last() {
            index
                .by_type
                .entry(latest.entity_type.as_str().to_string())
                .or_default()
                .insert(latest.id);
        }
    }
    for rel in relationships {
        if rel.relationship_type == RelationshipType::LocatedIn {
            index
                .by_room
                .entry(rel.to_entity_id)
                .or_default()
                .insert(rel.from_entity_id);
        }
    }
    index
}

#[async_trait]
impl GraphCrud for FileGraphStore {
    async fn store_entity(&self, entity: Entity) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let versions = state.entities.entry(entity.id).or_default();
        match versions.iter_mut().find(|e| e.version == entity.version) {
            Some(existing) => *existing = entity.clone(),
            None => versions.push(entity.clone()),
        }
        state
            .index
            .by_type
            .entry(entity.entity_type.as_str().to_string())
            .or_default()
            .insert(entity.id);

        self.persist(&state).map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn get_entity(&self, id: Uuid, version: Option<&str>) -> StoreResult<Option<Entity>> {
        let state = self.state.read().await;
        let Some(versions) = state.entities.get(&id) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => versions.iter().find(|e| e.version == v).cloned(),
            None if state.index.deleted.contains(&id) => None,
            None => versions.last().cloned(),
        })
    }

    async fn get_entity_versions(&self, id: Uuid) -> StoreResult<Vec<Entity>> {
        let state = self.state.read().await;
        let mut versions = state.entities.get(&id).cloned().unwrap_or_default();
        versions.sort_by_key(|e| e.created_at);
        Ok(versions)
    }

    async fn get_entities_by_type(&self, entity_type: EntityType) -> StoreResult<Vec<Entity>> {
        let state = self.state.read().await;
        let Some(ids) = state.index.by_type.get(entity_type.as_str()) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter(|id| !state.index.deleted.contains(id))
            .filter_map(|id| state.entities.get(id).and_then(|v| v.last().cloned()))
            .collect())
    }

    async fn delete_entity(&self, id: Uuid, _deleted_by: &str, _now: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.index.deleted.insert(id);
        for ids in state.index.by_type.values_mut() {
            ids.remove(&id);
        }
        self.persist(&state).map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn store_relationship(&self, relationship: EntityRelationship) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if relationship.relationship_type == RelationshipType::LocatedIn {
            state
                .index
                .by_room
                .entry(relationship.to_entity_id)
                .or_default()
                .insert(relationship.from_entity_id);
        }
        state.relationships.push(relationship);
        self.persist(&state).map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn get_relationships(
        &self,
        from: Option<Uuid>,
        to: Option<Uuid>,
        relationship_type: Option<RelationshipType>,
    ) -> StoreResult<Vec<EntityRelationship>> {
        let state = self.state.read().await;
        Ok(state
            .relationships
            .iter()
            .filter(|r| from.map(|f| f == r.from_entity_id).unwrap_or(true))
            .filter(|r| to.map(|t| t == r.to_entity_id).unwrap_or(true))
            .filter(|r| {
                relationship_type
                    .map(|rt| rt == r.relationship_type)
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn get_entities_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Entity>> {
        let state = self.state.read().await;
        Ok(state
            .entities
            .iter()
            .filter(|(id, _)| !state.index.deleted.contains(id))
            .filter_map(|(_, v)| v.last())
            .filter(|e| e.created_at >= since || e.updated_at >= since)
            .cloned()
            .collect())
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.entities.clear();
        state.relationships.clear();
        state.index = Index::default();
        for path in [
            self.entities_path(),
            self.relationships_path(),
            self.index_path(),
        ] {
            if path.exists() {
                std::fs::remove_file(path).map_err(SyncError::from).map_err(anyhow::Error::from)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GraphSearch for FileGraphStore {
    async fn search(
        &self,
        query: &str,
        types: Option<&[EntityType]>,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>> {
        let state = self.state.read().await;
        let candidates: Vec<Entity> = state
            .entities
            .iter()
            .filter(|(id, _)| !state.index.deleted.contains(id))
            .filter_map(|(_, v)| v.last())
            .filter(|e| types.map(|ts| ts.contains(&e.entity_type)).unwrap_or(true))
            .cloned()
            .collect();
        Ok(search::rank(candidates, query, limit))
    }
}

#[async_trait]
impl GraphTraversal for FileGraphStore {
    async fn find_path(&self, from: Uuid, to: Uuid, max_depth: usize) -> StoreResult<Option<Vec<Uuid>>> {
        if from == to {
            return Ok(Some(vec![from]));
        }
        let state = self.state.read().await;
        let mut visited = HashSet::new();
        visited.insert(from);
        let mut queue = VecDeque::new();
        queue.push_back(vec![from]);

        while let Some(path) = queue.pop_front() {
            let node = *path.last().unwrap();
            if path.len() - 1 >= max_depth {
                continue;
            }
            for rel in state.relationships.iter().filter(|r| r.from_entity_id == node) {
                if visited.contains(&rel.to_entity_id) {
                    continue;
                }
                let mut next = path.clone();
                next.push(rel.to_entity_id);
                if rel.to_entity_id == to {
                    return Ok(Some(next));
                }
                visited.insert(rel.to_entity_id);
                queue.push_back(next);
            }
        }
        Ok(None)
    }

    async fn get_subgraph(&self, root: Uuid, depth: usize) -> StoreResult<Subgraph> {
        let state = self.state.read().await;
        let mut visited = HashSet::new();
        visited.insert(root);
        let mut frontier = vec![root];
        let mut entities = Vec::new();
        let mut relationships = Vec::new();

        if let Some(e) = state.entities.get(&root).and_then(|v| v.last()) {
            entities.push(e.clone());
        }

        for _ in 0..depth {
            let mut next_frontier = Vec::new();
            for node in &frontier {
                for rel in state.relationships.iter().filter(|r| r.from_entity_id == *node) {
                    if !visited.contains(&rel.to_entity_id) {
                        visited.insert(rel.to_entity_id);
                        if let Some(e) = state.entities.get(&rel.to_entity_id).and_then(|v| v.last()) {
                            entities.push(e.clone());
                        }
                        next_frontier.push(rel.to_entity_id);
                    }
                    relationships.push(rel.clone());
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

    fn device(name: &str) -> Entity {
        let now = Utc::now();
        Entity::create(EntityType::Device, name, json!({}), SourceType::Manual, "alice", now).unwrap()
    }

    #[tokio::test]
    async fn store_and_reload_survives_a_fresh_open() {
        let dir = tempfile::tempdir().unwrap();
        let e = device("Lamp");
        {
            let store = FileGraphStore::open(dir.path()).unwrap();
            store.store_entity(e.clone()).await.unwrap();
        }

        let reopened = FileGraphStore::open(dir.path()).unwrap();
        let fetched = reopened.get_entity(e.id, None).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Lamp");
    }

    #[tokio::test]
    async fn newer_version_of_same_entity_becomes_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileGraphStore::open(dir.path()).unwrap();
        let e = device("Lamp");
        store.store_entity(e.clone()).await.unwrap();
        let child = e
            .create_child("bob", json!({"power": "on"}), None, Utc::now())
            .unwrap();
        store.store_entity(child.clone()).await.unwrap();

        let latest = store.get_entity(e.id, None).await.unwrap().unwrap();
        assert_eq!(latest.version, child.version);
        assert_eq!(store.get_entity_versions(e.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deleted_entity_is_absent_from_latest_lookups_but_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileGraphStore::open(dir.path()).unwrap();
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
    async fn clear_removes_entities_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileGraphStore::open(dir.path()).unwrap();
        store.store_entity(device("Lamp")).await.unwrap();
        store.clear().await.unwrap();

        assert!(!dir.path().join("entities.json").exists());
        assert_eq!(
            store.get_entities_by_type(EntityType::Device).await.unwrap().len(),
            0
        );
    }
}
