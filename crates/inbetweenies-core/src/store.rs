//! The local store contract (C2), split into three capability-bundle
//! traits rather than one abstract base (REDESIGN FLAGS §9). A single
//! backend type implements all three; `inbetweenies-store` provides a
//! SQLite backend and `inbetweenies-client` a file-backed one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Entity, EntityRelationship, EntityType, RelationshipType};
use crate::search::SearchResult;

/// Errors any store backend may return. Concrete backends convert their own
/// error types (`sqlx::Error`, `std::io::Error`, ...) into this at the
/// trait boundary.
pub type StoreResult<T> = anyhow::Result<T>;

/// Create/read/update-by-new-version/delete operations over entities and
/// relationships.
#[async_trait]
pub trait GraphCrud: Send + Sync {
    async fn store_entity(&self, entity: Entity) -> StoreResult<()>;

    /// `version = None` returns the latest version.
    async fn get_entity(&self, id: Uuid, version: Option<&str>) -> StoreResult<Option<Entity>>;

    /// Ascending by `created_at`.
    async fn get_entity_versions(&self, id: Uuid) -> StoreResult<Vec<Entity>>;

    /// Latest version of every entity of the given type.
    async fn get_entities_by_type(&self, entity_type: EntityType) -> StoreResult<Vec<Entity>>;

    /// Retire an entity's current latest version (tombstone), per the
    /// `delete` sync change type (§4.6). Past versions remain retrievable
    /// through `get_entity_versions`/`get_entity(id, Some(version))`; latest-
    /// version lookups and type/search listings stop surfacing the entity.
    async fn delete_entity(&self, id: Uuid, deleted_by: &str, now: DateTime<Utc>) -> StoreResult<()>;

    async fn store_relationship(&self, relationship: EntityRelationship) -> StoreResult<()>;

    /// `from`/`to` filter by entity id without a version filter, meaning
    /// only relationships anchored at that entity's latest version match.
    async fn get_relationships(
        &self,
        from: Option<Uuid>,
        to: Option<Uuid>,
        relationship_type: Option<RelationshipType>,
    ) -> StoreResult<Vec<EntityRelationship>>;

    /// Entities whose `created_at` or `updated_at` is at or after `since`,
    /// used by the delta engine.
    async fn get_entities_changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Entity>>;

    async fn clear(&self) -> StoreResult<()>;
}

#[async_trait]
pub trait GraphSearch: Send + Sync {
    async fn search(
        &self,
        query: &str,
        types: Option<&[EntityType]>,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>>;
}

/// A bounded-depth neighborhood around `root`.
#[derive(Debug, Clone)]
pub struct Subgraph {
    pub entities: Vec<Entity>,
    pub relationships: Vec<EntityRelationship>,
}

#[async_trait]
pub trait GraphTraversal: Send + Sync {
    /// Shortest path of entity ids from `from` to `to`, breadth-first,
    /// bounded by `max_depth` hops. `None` if unreachable within the bound.
    async fn find_path(&self, from: Uuid, to: Uuid, max_depth: usize) -> StoreResult<Option<Vec<Uuid>>>;

    /// Every entity and relationship reachable from `root` within `depth`
    /// hops, breadth-first.
    async fn get_subgraph(&self, root: Uuid, depth: usize) -> StoreResult<Subgraph>;
}
