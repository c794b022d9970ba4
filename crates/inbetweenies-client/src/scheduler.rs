//! Background sync scheduler (§4.7): ticks a delta-or-full sync on a fixed
//! interval and reports outcomes through observer events. Grounded on
//! `blowing-off/sync/client.py`'s `SyncScheduler`; the asyncio cancellable
//! sleep loop there becomes a `tokio::select!` against a `Notify` here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::SyncError;
use crate::state::SyncStateManager;
use crate::sync_client::{SyncClient, SyncProgress};

/// Observer events for a scheduled tick (§4.7).
#[derive(Debug, Clone)]
pub enum SyncEvent {
    SyncStarted,
    SyncComplete(SyncProgress),
    SyncFailed(String),
    SyncDisconnected,
}

pub type Observer = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Runs `SyncClient` on a fixed interval in a cooperative background task.
/// Cancellable at its sleep boundary (§5).
pub struct Scheduler {
    client: Arc<SyncClient>,
    state: Arc<Mutex<SyncStateManager>>,
    device_id: String,
    interval: Duration,
    observer: Observer,
    stop: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        client: Arc<SyncClient>,
        state: Arc<Mutex<SyncStateManager>>,
        device_id: impl Into<String>,
        interval: Duration,
        observer: Observer,
    ) -> Self {
        Self {
            client,
            state,
            device_id: device_id.into(),
            interval,
            observer,
            stop: Arc::new(Notify::new()),
            handle: None,
        }
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        let client = self.client.clone();
        let state = self.state.clone();
        let device_id = self.device_id.clone();
        let interval = self.interval;
        let observer = self.observer.clone();
        let stop = self.stop.clone();

        self.handle = Some(tokio::spawn(async move {
            loop {
                tick(&client, &state, &device_id, &observer).await;

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.notified() => break,
                }
            }
        }));
    }

    /// Cancel the run loop at its current sleep boundary and wait for it to
    /// finish.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.notify_one();
            let _ = handle.await;
        }
    }
}

async fn tick(client: &SyncClient, state: &Mutex<SyncStateManager>, device_id: &str, observer: &Observer) {
    observer(SyncEvent::SyncStarted);
    let started_at = Utc::now();
    let since = state.lock().await.last_sync_time();

    let result = if let Some(since) = since {
        client.sync_entities(None, Some(since)).await
    } else {
        client.full_sync().await
    };
    let completed_at = Utc::now();
    let sync_type = if since.is_some() { "delta" } else { "full" };

    match result {
        Ok(progress) => {
            let mut state = state.lock().await;
            if let Err(e) = state.record_sync(
                device_id,
                sync_type,
                started_at,
                completed_at,
                true,
                progress.synced_entities,
                progress.synced_relationships,
                progress.conflicts.len() as u32,
                None,
            ) {
                warn!("failed to persist sync state: {e}");
            }
            observer(SyncEvent::SyncComplete(progress));
        }
        Err(SyncError::Offline) => {
            observer(SyncEvent::SyncDisconnected);
        }
        Err(e) => {
            let mut state = state.lock().await;
            if let Err(persist_err) = state.record_sync(
                device_id,
                sync_type,
                started_at,
                completed_at,
                false,
                0,
                0,
                0,
                Some(e.to_string()),
            ) {
                warn!("failed to persist sync state: {persist_err}");
            }
            observer(SyncEvent::SyncFailed(e.to_string()));
        }
    }
}
