//! Sync state manager (C8): the pending-change queue, vector clock, sync
//! history, conflict log, performance metrics, and retry backoff schedule
//! for one client device. Persisted as a single JSON file.

use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use inbetweenies_core::models::{ChangeType, PendingChange, VectorClock};

use crate::error::Result;

const RETRY_BASE: i64 = 30;
const RETRY_CAP: i64 = 1920;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub total_syncs: u32,
    pub successful_syncs: u32,
    pub failed_syncs: u32,
    pub total_entities_synced: u32,
    pub total_relationships_synced: u32,
    pub total_conflicts: u32,
    pub last_sync_duration_ms: f64,
    pub average_sync_duration_ms: f64,
}

impl SyncMetrics {
    fn record(&mut self, success: bool, duration_ms: f64, entities: u32, relationships: u32, conflicts: u32) {
        self.total_syncs += 1;
        if success {
            self.successful_syncs += 1;
        } else {
            self.failed_syncs += 1;
        }
        self.total_entities_synced += entities;
        self.total_relationships_synced += relationships;
        self.total_conflicts += conflicts;
        self.last_sync_duration_ms = duration_ms;
        self.average_sync_duration_ms = (self.average_sync_duration_ms
            * (self.total_syncs - 1) as f64
            + duration_ms)
            / self.total_syncs as f64;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    pub device_id: String,
    pub sync_type: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    pub entities_synced: u32,
    pub relationships_synced: u32,
    pub conflicts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictLogEntry {
    pub entity_id: Uuid,
    pub local_version: String,
    pub remote_version: String,
    pub resolution_strategy: String,
    pub resolved_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Persisted {
    vector_clock: VectorClock,
    pending_changes: Vec<PendingChange>,
    metrics: SyncMetrics,
    history: Vec<SyncHistoryEntry>,
    conflict_log: Vec<ConflictLogEntry>,
    next_retry_time: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

pub struct SyncStateManager {
    path: PathBuf,
    state: Persisted,
}

impl SyncStateManager {
    pub fn open(storage_path: impl Into<PathBuf>) -> Result<Self> {
        let dir = storage_path.into();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("sync_state.json");
        let state = if path.exists() {
            serde_json::from_slice(&std::fs::read(&path)?)?
        } else {
            Persisted::default()
        };
        Ok(Self { path, state })
    }

    fn save(&self) -> Result<()> {
        std::fs::write(&self.path, serde_json::to_vec_pretty(&self.state)?)?;
        Ok(())
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.state.vector_clock
    }

    pub fn update_vector_clock(&mut self, device_id: impl Into<String>, version: impl Into<String>) -> Result<()> {
        self.state.vector_clock.set(device_id, version);
        self.save()
    }

    pub fn add_pending_change(
        &mut self,
        change_type: ChangeType,
        entity_id: Option<Uuid>,
        entity_data: Option<serde_json::Value>,
        relationship_data: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<PendingChange> {
        let change = PendingChange::new(change_type, entity_id, entity_data, relationship_data, now);
        self.state.pending_changes.push(change.clone());
        self.save()?;
        Ok(change)
    }

    pub fn pending_changes(&self) -> &[PendingChange] {
        &self.state.pending_changes
    }

    pub fn mark_synced(&mut self, change_id: Uuid) -> Result<()> {
        self.state.pending_changes.retain(|c| c.id != change_id);
        self.save()
    }

    pub fn mark_failed(&mut self, change_id: Uuid, error: impl Into<String>) -> Result<()> {
        if let Some(change) = self.state.pending_changes.iter_mut().find(|c| c.id == change_id) {
            change.attempts += 1;
            change.last_error = Some(error.into());
        }
        self.save()
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.state.metrics
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_sync(
        &mut self,
        device_id: impl Into<String>,
        sync_type: impl Into<String>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        success: bool,
        entities: u32,
        relationships: u32,
        conflicts: u32,
        error: Option<String>,
    ) -> Result<()> {
        let duration_ms = (completed_at - started_at).num_milliseconds() as f64;
        self.state
            .metrics
            .record(success, duration_ms, entities, relationships, conflicts);

        if success {
            self.state.consecutive_failures = 0;
            self.state.next_retry_time = None;
        } else {
            self.state.next_retry_time = Some(completed_at + self.backoff());
            self.state.consecutive_failures += 1;
        }

        self.state.history.push(SyncHistoryEntry {
            device_id: device_id.into(),
            sync_type: sync_type.into(),
            started_at,
            completed_at,
            success,
            entities_synced: entities,
            relationships_synced: relationships,
            conflicts,
            error,
        });
        self.save()
    }

    /// Exponential backoff, base 30s doubling per consecutive failure so far
    /// (the one about to be recorded is not yet counted), capped at 32
    /// minutes after the 7th failure.
    fn backoff(&self) -> ChronoDuration {
        let exponent = self.state.consecutive_failures.min(6);
        let seconds = RETRY_BASE.saturating_mul(1i64 << exponent).min(RETRY_CAP);
        ChronoDuration::seconds(seconds)
    }

    pub fn next_retry_time(&self) -> Option<DateTime<Utc>> {
        self.state.next_retry_time
    }

    pub fn record_conflict(&mut self, entry: ConflictLogEntry) -> Result<()> {
        self.state.conflict_log.push(entry);
        self.save()
    }

    pub fn sync_history(&self, limit: usize) -> Vec<&SyncHistoryEntry> {
        self.state.history.iter().rev().take(limit).collect()
    }

    pub fn conflict_history(&self, entity_id: Option<Uuid>) -> Vec<&ConflictLogEntry> {
        self.state
            .conflict_log
            .iter()
            .filter(|c| entity_id.map(|id| id == c.entity_id).unwrap_or(true))
            .collect()
    }

    /// Drop history and conflict-log entries older than `days`.
    pub fn clear_old_history(&mut self, days: i64, now: DateTime<Utc>) -> Result<()> {
        let cutoff = now - ChronoDuration::days(days);
        self.state.history.retain(|h| h.started_at >= cutoff);
        self.state.conflict_log.retain(|c| c.created_at >= cutoff);
        self.save()
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.state
            .history
            .iter()
            .filter(|h| h.success)
            .map(|h| h.completed_at)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_change_round_trips_through_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let change_id = {
            let mut mgr = SyncStateManager::open(dir.path()).unwrap();
            mgr.add_pending_change(ChangeType::Create, None, None, None, now)
                .unwrap()
                .id
        };

        let mgr = SyncStateManager::open(dir.path()).unwrap();
        assert_eq!(mgr.pending_changes().len(), 1);
        assert_eq!(mgr.pending_changes()[0].id, change_id);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = SyncStateManager::open(dir.path()).unwrap();
        let t0 = Utc::now();

        mgr.record_sync("dev-1", "delta", t0, t0, false, 0, 0, 0, Some("timeout".into()))
            .unwrap();
        let first_backoff = mgr.next_retry_time().unwrap() - t0;
        assert_eq!(first_backoff, ChronoDuration::seconds(RETRY_BASE));

        for _ in 0..10 {
            mgr.record_sync("dev-1", "delta", t0, t0, false, 0, 0, 0, Some("timeout".into()))
                .unwrap();
        }
        let capped_backoff = mgr.next_retry_time().unwrap() - t0;

        assert!(capped_backoff > first_backoff);
        assert!(capped_backoff <= ChronoDuration::seconds(RETRY_CAP));
    }

    #[test]
    fn successful_sync_resets_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = SyncStateManager::open(dir.path()).unwrap();
        let t0 = Utc::now();
        mgr.record_sync("dev-1", "delta", t0, t0, false, 0, 0, 0, Some("e".into())).unwrap();
        assert!(mgr.next_retry_time().is_some());

        mgr.record_sync("dev-1", "delta", t0, t0, true, 5, 2, 0, None).unwrap();
        assert!(mgr.next_retry_time().is_none());
    }
}
