//! Sync API endpoints: the `POST /api/v1/sync/` handler plus the status and
//! manual-conflict-resolution surfaces described in §6.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use inbetweenies_core::conflict::ConflictStrategy;
use inbetweenies_core::protocol::{
    PendingConflict, ResolveConflictRequest, SyncRequest, SyncResponse, SyncStatusResponse,
    PROTOCOL_VERSION,
};
use inbetweenies_core::store::GraphCrud;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::sync::handle_sync;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(sync))
        .route("/status", get(status))
        .route("/conflicts", get(conflicts))
        .route("/conflicts/{id}/resolve", post(resolve_conflict))
}

async fn sync(State(state): State<AppState>, Json(request): Json<SyncRequest>) -> Result<Json<SyncResponse>> {
    let response = handle_sync(&state, request).await?;
    Ok(Json(response))
}

#[derive(Deserialize)]
struct StatusQuery {
    device_id: String,
}

async fn status(State(state): State<AppState>, Query(q): Query<StatusQuery>) -> Result<Json<SyncStatusResponse>> {
    let last_sync = state.watermarks().lock().await.get(&q.device_id);
    Ok(Json(SyncStatusResponse {
        device_id: q.device_id,
        last_sync,
        protocol_version: PROTOCOL_VERSION.to_string(),
    }))
}

async fn conflicts(State(state): State<AppState>) -> Result<Json<Vec<PendingConflict>>> {
    let resolver = state.conflicts().lock().await;
    let pending = resolver
        .pending_manual_resolutions()
        .iter()
        .map(|c| PendingConflict {
            id: c.id,
            entity_id: c.entity_id,
            local: c.local.clone(),
            remote: c.remote.clone(),
            queued_at: c.queued_at,
        })
        .collect();
    Ok(Json(pending))
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResolveConflictRequest>,
) -> Result<Json<inbetweenies_core::models::Entity>> {
    let strategy = parse_strategy(&body.strategy)?;

    let mut resolver = state.conflicts().lock().await;
    let conflict = resolver
        .resolve_manual(id)
        .ok_or_else(|| AppError::NotFound(format!("no pending conflict {id}")))?;

    let resolution = resolver.resolve(&conflict.local, &conflict.remote, strategy, Utc::now());
    let resolved = resolution
        .resolved_entity
        .ok_or_else(|| AppError::BadRequest("resolution strategy did not produce a resolved entity".to_string()))?;

    drop(resolver);
    state.store().store_entity(resolved.clone()).await.map_err(AppError::Store)?;
    Ok(Json(resolved))
}

fn parse_strategy(s: &str) -> Result<ConflictStrategy> {
    match s {
        "last_write_wins" => Ok(ConflictStrategy::LastWriteWins),
        "merge" => Ok(ConflictStrategy::Merge),
        "custom" => Ok(ConflictStrategy::Custom),
        "client_wins" => Ok(ConflictStrategy::ClientWins),
        "server_wins" => Ok(ConflictStrategy::ServerWins),
        other => Err(AppError::BadRequest(format!("unknown resolution strategy: {other}"))),
    }
}
