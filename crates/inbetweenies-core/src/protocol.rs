//! Wire protocol types (§6): the JSON shapes exchanged over
//! `POST /api/v1/sync/`. Parsed once at the HTTP boundary into these typed
//! structs — nothing downstream touches raw `serde_json::Value` for
//! protocol framing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Entity, EntityRelationship, EntityType, VectorClock};

/// Protocol version this implementation speaks. A request naming anything
/// else is rejected before any other processing (§4.6).
pub const PROTOCOL_VERSION: &str = "inbetweenies-v2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Full,
    Delta,
    Entities,
    Relationships,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// A single entity-side change carried in a `SyncChange`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityChange {
    pub entity: Entity,
}

/// A single relationship-side change carried in a `SyncChange`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipChange {
    pub relationship: EntityRelationship,
}

/// One change in a sync request/response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChange {
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<RelationshipChange>,
}

/// Filters a client may attach to a `full`/`delta` sync request. The server
/// silently ignores any filter it cannot honor rather than erroring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_types: Option<Vec<EntityType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub protocol_version: String,
    pub device_id: String,
    pub user_id: String,
    pub sync_type: SyncType,
    #[serde(default)]
    pub vector_clock: VectorClock,
    #[serde(default)]
    pub changes: Vec<SyncChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<SyncFilters>,
}

/// A conflict the server resolved (or queued for manual resolution) while
/// applying an incoming change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub entity_id: uuid::Uuid,
    pub local_version: String,
    pub remote_version: String,
    pub resolution_strategy: String,
    /// Empty when the conflict required manual resolution and none is
    /// available yet.
    #[serde(default)]
    pub resolved_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub entities_synced: u32,
    pub relationships_synced: u32,
    pub conflicts_resolved: u32,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub sync_type: SyncType,
    pub changes: Vec<SyncChange>,
    pub conflicts: Vec<ConflictInfo>,
    pub vector_clock: VectorClock,
    pub sync_stats: SyncStats,
}

/// `GET /api/v1/sync/status?device_id=...` response: `{device_id, last_sync,
/// protocol_version}` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusResponse {
    pub device_id: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub protocol_version: String,
}

/// One entry in `GET /api/v1/sync/conflicts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConflict {
    pub id: uuid::Uuid,
    pub entity_id: uuid::Uuid,
    pub local: Entity,
    pub remote: Entity,
    pub queued_at: DateTime<Utc>,
}

/// `POST /api/v1/sync/conflicts/{id}/resolve` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveConflictRequest {
    pub strategy: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_request_round_trips_through_json() {
        let req = SyncRequest {
            protocol_version: PROTOCOL_VERSION.to_string(),
            device_id: "device-1".to_string(),
            user_id: "alice".to_string(),
            sync_type: SyncType::Delta,
            vector_clock: VectorClock::new(),
            changes: vec![],
            filters: None,
        };

        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("inbetweenies-v2"));
        let back: SyncRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.device_id, "device-1");
        assert_eq!(back.sync_type, SyncType::Delta);
    }
}
