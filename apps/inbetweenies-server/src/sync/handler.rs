//! Sync protocol handler (C6): processes one `SyncRequest` per §4.6's
//! processing order and returns the matching `SyncResponse`.

use chrono::{DateTime, Utc};

use inbetweenies_core::conflict::ConflictStrategy;
use inbetweenies_core::delta::{calculate_delta, DeltaSource};
use inbetweenies_core::models::{Entity, EntityRelationship, EntityType};
use inbetweenies_core::protocol::{
    ChangeType, ConflictInfo, EntityChange, RelationshipChange, SyncChange, SyncRequest,
    SyncResponse, SyncStats, SyncType, PROTOCOL_VERSION,
};
use inbetweenies_core::store::{GraphCrud, GraphSearch};

use crate::error::{AppError, Result};
use crate::state::AppState;

const ALL_ENTITY_TYPES: [EntityType; 11] = [
    EntityType::Home,
    EntityType::Room,
    EntityType::Device,
    EntityType::Zone,
    EntityType::Door,
    EntityType::Window,
    EntityType::Procedure,
    EntityType::Manual,
    EntityType::Note,
    EntityType::Schedule,
    EntityType::Automation,
];

/// An in-memory snapshot `calculate_delta`/`apply_delta` can read synchronously,
/// assembled from one or more async store reads up front (the delta engine
/// itself is pure computation and does not suspend).
struct Snapshot {
    entities: Vec<Entity>,
    relationships: Vec<EntityRelationship>,
}

impl DeltaSource for Snapshot {
    fn entities_changed_since(&self, since: DateTime<Utc>) -> Vec<Entity> {
        self.entities
            .iter()
            .filter(|e| e.created_at >= since || e.updated_at >= since)
            .cloned()
            .collect()
    }

    fn relationships_created_since(&self, since: DateTime<Utc>) -> Vec<EntityRelationship> {
        self.relationships
            .iter()
            .filter(|r| r.created_at >= since)
            .cloned()
            .collect()
    }

    fn latest_entity(&self, id: uuid::Uuid) -> Option<Entity> {
        self.entities.iter().find(|e| e.id == id).cloned()
    }

    fn relationship_exists(&self, from_id: uuid::Uuid, to_id: uuid::Uuid, relationship_type: &str) -> bool {
        self.relationships
            .iter()
            .any(|r| r.from_entity_id == from_id && r.to_entity_id == to_id && r.relationship_type.as_str() == relationship_type)
    }
}

pub async fn handle_sync(state: &AppState, request: SyncRequest) -> Result<SyncResponse> {
    if request.protocol_version != PROTOCOL_VERSION {
        return Err(AppError::Protocol(format!(
            "unsupported protocol_version: {} (expected {PROTOCOL_VERSION})",
            request.protocol_version
        )));
    }

    let now = Utc::now();
    let mut stats = SyncStats::default();
    let mut conflicts = Vec::new();

    for change in &request.changes {
        apply_incoming_change(state, &request, change, now, &mut stats, &mut conflicts).await?;
    }

    let outgoing = select_outgoing_changes(state, &request, now).await?;

    {
        let mut watermarks = state.watermarks().lock().await;
        watermarks.advance(request.device_id.clone(), now);
    }

    stats.duration_ms = (Utc::now() - now).num_milliseconds() as f64;

    Ok(SyncResponse {
        sync_type: request.sync_type,
        changes: outgoing,
        conflicts,
        vector_clock: request.vector_clock.clone(),
        sync_stats: stats,
    })
}

async fn apply_incoming_change(
    state: &AppState,
    request: &SyncRequest,
    change: &SyncChange,
    now: DateTime<Utc>,
    stats: &mut SyncStats,
    conflicts: &mut Vec<ConflictInfo>,
) -> Result<()> {
    match change.change_type {
        ChangeType::Create => {
            if let Some(EntityChange { entity }) = &change.entity {
                let lock = state.lock_entity(entity.id).await;
                let _guard = lock.lock().await;
                let existing = state.store().get_entity(entity.id, None).await.map_err(AppError::Store)?;
                if existing.is_none() {
                    state.store().store_entity(entity.clone()).await.map_err(AppError::Store)?;
                    stats.entities_synced += 1;
                }
                // A replayed create is a no-op, not a conflict (L3).
            }
        }
        ChangeType::Update => {
            if let Some(EntityChange { entity: incoming }) = &change.entity {
                let lock = state.lock_entity(incoming.id).await;
                let _guard = lock.lock().await;
                match state.store().get_entity(incoming.id, None).await.map_err(AppError::Store)? {
                    None => {
                        state.store().store_entity(incoming.clone()).await.map_err(AppError::Store)?;
                        stats.entities_synced += 1;
                    }
                    Some(stored) => {
                        let fast_forward = incoming
                            .parent_versions
                            .first()
                            .is_some_and(|p| *p == stored.version);

                        if fast_forward {
                            state.store().store_entity(incoming.clone()).await.map_err(AppError::Store)?;
                            stats.entities_synced += 1;
                        } else {
                            let strategy = state.config().sync.conflict_strategy;
                            let resolution = {
                                let mut resolver = state.conflicts().lock().await;
                                resolver.resolve(&stored, incoming, strategy, now)
                            };

                            let resolution_strategy = strategy_name(strategy);
                            match resolution.resolved_entity {
                                Some(resolved) => {
                                    state
                                        .store()
                                        .store_entity(resolved.clone())
                                        .await
                                        .map_err(AppError::Store)?;
                                    stats.entities_synced += 1;
                                    stats.conflicts_resolved += 1;
                                    conflicts.push(ConflictInfo {
                                        entity_id: incoming.id,
                                        local_version: stored.version.clone(),
                                        remote_version: incoming.version.clone(),
                                        resolution_strategy,
                                        resolved_version: resolved.version,
                                    });
                                }
                                None => {
                                    // Manual strategy: queued on the resolver,
                                    // surfaced here with an empty resolved_version.
                                    stats.conflicts_resolved += 1;
                                    conflicts.push(ConflictInfo {
                                        entity_id: incoming.id,
                                        local_version: stored.version.clone(),
                                        remote_version: incoming.version.clone(),
                                        resolution_strategy,
                                        resolved_version: String::new(),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
        ChangeType::Delete => {
            if let Some(EntityChange { entity }) = &change.entity {
                let lock = state.lock_entity(entity.id).await;
                let _guard = lock.lock().await;
                state
                    .store()
                    .delete_entity(entity.id, &request.user_id, now)
                    .await
                    .map_err(AppError::Store)?;
                state.tombstones().lock().await.record(entity.id, request.user_id.clone(), now);
                stats.entities_synced += 1;
            }
        }
    }

    for RelationshipChange { relationship } in &change.relationships {
        state
            .store()
            .store_relationship(relationship.clone())
            .await
            .map_err(AppError::Store)?;
        stats.relationships_synced += 1;
    }

    Ok(())
}

fn strategy_name(strategy: ConflictStrategy) -> String {
    match strategy {
        ConflictStrategy::LastWriteWins => "last_write_wins",
        ConflictStrategy::Merge => "merge",
        ConflictStrategy::Manual => "manual",
        ConflictStrategy::Custom => "custom",
        ConflictStrategy::ClientWins => "client_wins",
        ConflictStrategy::ServerWins => "server_wins",
    }
    .to_string()
}

async fn select_outgoing_changes(
    state: &AppState,
    request: &SyncRequest,
    now: DateTime<Utc>,
) -> Result<Vec<SyncChange>> {
    let requested_types: Option<Vec<EntityType>> = request
        .filters
        .as_ref()
        .and_then(|f| f.entity_types.clone());

    match request.sync_type {
        SyncType::Delta => {
            let watermark = state.watermarks().lock().await.get(&request.device_id);
            let since = watermark.or_else(|| request.filters.as_ref().and_then(|f| f.since));
            let snapshot = fetch_snapshot(state, requested_types.as_deref()).await?;
            let delta = calculate_delta(&snapshot, since, now);

            let mut changes: Vec<SyncChange> = delta
                .added_entities
                .into_iter()
                .map(|entity| SyncChange {
                    change_type: ChangeType::Create,
                    entity: Some(EntityChange { entity }),
                    relationships: Vec::new(),
                })
                .chain(delta.modified_entities.into_iter().map(|entity| SyncChange {
                    change_type: ChangeType::Update,
                    entity: Some(EntityChange { entity }),
                    relationships: Vec::new(),
                }))
                .collect();
            sort_changes(&mut changes);
            Ok(changes)
        }
        SyncType::Full => {
            let entities = fetch_entities(state, requested_types.as_deref()).await?;
            let mut changes: Vec<SyncChange> = entities
                .into_iter()
                .map(|entity| SyncChange {
                    change_type: ChangeType::Create,
                    entity: Some(EntityChange { entity }),
                    relationships: Vec::new(),
                })
                .collect();
            sort_changes(&mut changes);
            Ok(changes)
        }
        SyncType::Entities => {
            let entities = fetch_entities(state, requested_types.as_deref()).await?;
            let mut changes: Vec<SyncChange> = entities
                .into_iter()
                .map(|entity| SyncChange {
                    change_type: ChangeType::Create,
                    entity: Some(EntityChange { entity }),
                    relationships: Vec::new(),
                })
                .collect();
            sort_changes(&mut changes);
            Ok(changes)
        }
        SyncType::Relationships => {
            let relationships = state
                .store()
                .get_relationships(None, None, None)
                .await
                .map_err(AppError::Store)?;
            Ok(relationships
                .into_iter()
                .map(|relationship| SyncChange {
                    change_type: ChangeType::Create,
                    entity: None,
                    relationships: vec![RelationshipChange { relationship }],
                })
                .collect())
        }
    }
}

async fn fetch_entities(state: &AppState, types: Option<&[EntityType]>) -> Result<Vec<Entity>> {
    let wanted: &[EntityType] = types.unwrap_or(&ALL_ENTITY_TYPES);
    let mut entities = Vec::new();
    for t in wanted {
        entities.extend(
            state
                .store()
                .get_entities_by_type(*t)
                .await
                .map_err(AppError::Store)?,
        );
    }
    Ok(entities)
}

async fn fetch_snapshot(state: &AppState, types: Option<&[EntityType]>) -> Result<Snapshot> {
    let entities = fetch_entities(state, types).await?;
    let relationships = state
        .store()
        .get_relationships(None, None, None)
        .await
        .map_err(AppError::Store)?;
    Ok(Snapshot { entities, relationships })
}

fn sort_changes(changes: &mut [SyncChange]) {
    changes.sort_by(|a, b| {
        let key = |c: &SyncChange| {
            c.entity
                .as_ref()
                .map(|ec| (ec.entity.id, ec.entity.version.clone()))
        };
        key(a).cmp(&key(b))
    });
}

/// Entry point the search endpoint shares with the sync handler's need to
/// enumerate entities of one or more types.
pub async fn search_entities(
    state: &AppState,
    query: &str,
    types: Option<&[EntityType]>,
    limit: usize,
) -> Result<Vec<inbetweenies_core::search::SearchResult>> {
    state.store().search(query, types, limit).await.map_err(AppError::Store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use inbetweenies_core::models::SourceType;
    use inbetweenies_core::protocol::{SyncFilters, VectorClock};
    use serde_json::json;

    async fn test_state() -> AppState {
        let pool = inbetweenies_store::create_pool(":memory:").await.unwrap();
        let store = inbetweenies_store::SqliteGraphStore::new(pool);
        AppState::new(crate::config::Config::default(), store, inbetweenies_core::delta::TombstoneLog::new())
    }

    fn base_request(changes: Vec<SyncChange>) -> SyncRequest {
        SyncRequest {
            protocol_version: PROTOCOL_VERSION.to_string(),
            device_id: "device-1".to_string(),
            user_id: "alice".to_string(),
            sync_type: SyncType::Delta,
            vector_clock: VectorClock::new(),
            changes,
            filters: None,
        }
    }

    #[tokio::test]
    async fn rejects_mismatched_protocol_version() {
        let state = test_state().await;
        let mut request = base_request(Vec::new());
        request.protocol_version = "inbetweenies-v1".to_string();

        let result = handle_sync(&state, request).await;
        assert!(matches!(result, Err(AppError::Protocol(_))));
    }

    #[tokio::test]
    async fn empty_pending_queue_is_a_valid_request() {
        let state = test_state().await;
        let response = handle_sync(&state, base_request(Vec::new())).await.unwrap();
        assert_eq!(response.sync_stats.entities_synced, 0);
        assert!(response.conflicts.is_empty());
    }

    #[tokio::test]
    async fn fast_forward_update_applies_without_conflict() {
        let state = test_state().await;
        let t0 = Utc::now();
        let root = Entity::create(EntityType::Device, "Lamp", json!({"power": "off"}), SourceType::Manual, "alice", t0).unwrap();
        state.store().store_entity(root.clone()).await.unwrap();

        let child = root.create_child("bob", json!({"power": "on"}), None, t0 + chrono::Duration::seconds(1)).unwrap();
        let request = base_request(vec![SyncChange {
            change_type: ChangeType::Update,
            entity: Some(EntityChange { entity: child.clone() }),
            relationships: Vec::new(),
        }]);

        let response = handle_sync(&state, request).await.unwrap();
        assert!(response.conflicts.is_empty());
        assert_eq!(response.sync_stats.entities_synced, 1);

        let stored = state.store().get_entity(root.id, None).await.unwrap().unwrap();
        assert_eq!(stored.version, child.version);
    }

    #[tokio::test]
    async fn diverging_update_produces_one_conflict_and_a_two_parent_merge() {
        let state = test_state().await;
        let t0 = Utc::now();
        let root = Entity::create(
            EntityType::Device,
            "Lamp",
            json!({"power": "off", "color": "red"}),
            SourceType::Manual,
            "alice",
            t0,
        )
        .unwrap();
        state.store().store_entity(root.clone()).await.unwrap();

        // Local moves ahead first.
        let local_child = root
            .create_child("alice", json!({"color": "blue"}), None, t0 + chrono::Duration::seconds(1))
            .unwrap();
        state.store().store_entity(local_child.clone()).await.unwrap();

        // A remote change, branched from the original root, arrives after.
        let remote_child = root
            .create_child("bob", json!({"power": "on"}), None, t0 + chrono::Duration::seconds(2))
            .unwrap();

        let request = base_request(vec![SyncChange {
            change_type: ChangeType::Update,
            entity: Some(EntityChange { entity: remote_child.clone() }),
            relationships: Vec::new(),
        }]);

        let response = handle_sync(&state, request).await.unwrap();
        assert_eq!(response.conflicts.len(), 1);
        assert_eq!(response.sync_stats.conflicts_resolved, 1);

        let conflict = &response.conflicts[0];
        assert_eq!(conflict.entity_id, root.id);
        assert_eq!(conflict.local_version, local_child.version);
        assert_eq!(conflict.remote_version, remote_child.version);
        assert!(!conflict.resolved_version.is_empty());

        let stored = state.store().get_entity(root.id, None).await.unwrap().unwrap();
        assert_eq!(stored.version, conflict.resolved_version);
        assert!(stored.parent_versions.contains(&local_child.version));
        assert!(stored.parent_versions.contains(&remote_child.version));
        // Both keys diverge between the two sides, so the merge keeps the
        // locally-stored value for each (merge_dicts' disagreement rule).
        assert_eq!(stored.content["color"], "blue");
        assert_eq!(stored.content["power"], "off");
    }

    #[tokio::test]
    async fn replayed_create_is_not_counted_twice() {
        let state = test_state().await;
        let entity = Entity::create(EntityType::Room, "Kitchen", json!({}), SourceType::Manual, "alice", Utc::now()).unwrap();

        let change = SyncChange {
            change_type: ChangeType::Create,
            entity: Some(EntityChange { entity: entity.clone() }),
            relationships: Vec::new(),
        };

        let first = handle_sync(&state, base_request(vec![change.clone()])).await.unwrap();
        assert_eq!(first.sync_stats.entities_synced, 1);

        let second = handle_sync(&state, base_request(vec![change])).await.unwrap();
        assert_eq!(second.sync_stats.entities_synced, 0);
        assert!(second.conflicts.is_empty());
    }

    #[tokio::test]
    async fn delete_change_tombstones_entity_and_is_absent_from_full_sync() {
        let state = test_state().await;
        let entity = Entity::create(EntityType::Note, "Reminder", json!({}), SourceType::Manual, "alice", Utc::now()).unwrap();
        state.store().store_entity(entity.clone()).await.unwrap();

        let request = base_request(vec![SyncChange {
            change_type: ChangeType::Delete,
            entity: Some(EntityChange { entity: entity.clone() }),
            relationships: Vec::new(),
        }]);
        handle_sync(&state, request).await.unwrap();

        assert!(state.store().get_entity(entity.id, None).await.unwrap().is_none());
        assert!(state.tombstones().lock().await.is_deleted(&entity.id));

        let mut full_request = base_request(Vec::new());
        full_request.sync_type = SyncType::Full;
        full_request.filters = Some(SyncFilters {
            entity_types: Some(vec![EntityType::Note]),
            since: None,
            modified_by: None,
        });
        let response = handle_sync(&state, full_request).await.unwrap();
        assert!(response.changes.is_empty());
    }

    #[tokio::test]
    async fn delta_sync_returns_entities_changed_since_watermark() {
        let state = test_state().await;
        let t0 = Utc::now();
        let entity = Entity::create(EntityType::Room, "Office", json!({}), SourceType::Manual, "alice", t0).unwrap();
        state.store().store_entity(entity.clone()).await.unwrap();

        // First sync has no watermark yet: treated as a full sync.
        let first = handle_sync(&state, base_request(Vec::new())).await.unwrap();
        assert_eq!(first.changes.len(), 1);

        // A second sync with nothing new since the watermark returns nothing.
        let second = handle_sync(&state, base_request(Vec::new())).await.unwrap();
        assert!(second.changes.is_empty());
    }
}
