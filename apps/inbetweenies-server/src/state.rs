//! Application state management.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use inbetweenies_core::conflict::ConflictResolver;
use inbetweenies_core::delta::{TombstoneLog, Watermarks};
use inbetweenies_store::SqliteGraphStore;

use crate::config::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    store: SqliteGraphStore,
    /// §4.4: strategy dispatch and pending-manual queue are shared across
    /// every request, so mutation goes through a mutex.
    conflicts: AsyncMutex<ConflictResolver>,
    /// §4.5's deletion log, hydrated from the `tombstones` table at startup
    /// and kept in memory for `calculate_delta` to consult cheaply.
    tombstones: AsyncMutex<TombstoneLog>,
    /// Per-device last-successful-sync times (§4.6 step 3).
    watermarks: AsyncMutex<Watermarks>,
    /// §5's "single writer per entity id" rule: a per-id lock, guarded by
    /// one outer mutex protecting the map itself.
    entity_locks: AsyncMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl AppState {
    pub fn new(config: Config, store: SqliteGraphStore, tombstones: TombstoneLog) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                conflicts: AsyncMutex::new(ConflictResolver::new()),
                tombstones: AsyncMutex::new(tombstones),
                watermarks: AsyncMutex::new(Watermarks::new()),
                entity_locks: AsyncMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &SqliteGraphStore {
        &self.inner.store
    }

    pub fn conflicts(&self) -> &AsyncMutex<ConflictResolver> {
        &self.inner.conflicts
    }

    pub fn tombstones(&self) -> &AsyncMutex<TombstoneLog> {
        &self.inner.tombstones
    }

    pub fn watermarks(&self) -> &AsyncMutex<Watermarks> {
        &self.inner.watermarks
    }

    /// Acquire the per-entity write lock for `id`, creating it on first use.
    pub async fn lock_entity(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.entity_locks.lock().await;
        locks.entry(id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}
