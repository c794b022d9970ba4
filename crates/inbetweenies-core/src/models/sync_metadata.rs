//! Per-client sync bookkeeping shared between the client and server views of
//! sync progress (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Vector clock: the last-seen version token per device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VectorClock {
    pub clocks: HashMap<String, String>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<&str> {
        self.clocks.get(device_id).map(|s| s.as_str())
    }

    pub fn set(&mut self, device_id: impl Into<String>, version: impl Into<String>) {
        self.clocks.insert(device_id.into(), version.into());
    }

    /// Merge `other` into `self`, keeping the lexicographically greater
    /// version string per device (version strings are timestamp-prefixed,
    /// so this is also the more-recent one).
    pub fn merge(&mut self, other: &VectorClock) {
        for (device_id, version) in &other.clocks {
            match self.clocks.get(device_id) {
                Some(existing) if existing.as_str() >= version.as_str() => {}
                _ => {
                    self.clocks.insert(device_id.clone(), version.clone());
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// A locally-made change waiting to be pushed to the server (C8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: uuid::Uuid,
    pub change_type: ChangeType,
    pub entity_id: Option<uuid::Uuid>,
    pub entity_data: Option<serde_json::Value>,
    pub relationship_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl PendingChange {
    pub fn new(
        change_type: ChangeType,
        entity_id: Option<uuid::Uuid>,
        entity_data: Option<serde_json::Value>,
        relationship_data: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            change_type,
            entity_id,
            entity_data,
            relationship_data,
            created_at: now,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Sync metadata tracked per client/device by the client's state manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub client_id: String,
    pub server_url: String,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_success: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub sync_failures: u32,
    pub total_syncs: u32,
    pub total_conflicts: u32,
    pub sync_in_progress: bool,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub vector_clock: VectorClock,
}

impl SyncMetadata {
    pub fn new(client_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            server_url: server_url.into(),
            last_sync_time: None,
            last_sync_success: None,
            last_sync_error: None,
            sync_failures: 0,
            total_syncs: 0,
            total_conflicts: 0,
            sync_in_progress: false,
            next_retry_time: None,
            vector_clock: VectorClock::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_clock_merge_keeps_greater_version() {
        let mut a = VectorClock::new();
        a.set("dev-1", "2024-01-01T00:00:00Z-u1");
        let mut b = VectorClock::new();
        b.set("dev-1", "2024-02-01T00:00:00Z-u2");

        a.merge(&b);
        assert_eq!(a.get("dev-1"), Some("2024-02-01T00:00:00Z-u2"));
    }
}
