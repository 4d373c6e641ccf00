use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use image_archiver_core::{ExportedFile, LockState, RunState, TriggerSource};
use image_archiver_storage::ArchiveRepository;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::orchestrator::{RunOrchestrator, RunReport};

const DEFAULT_EXPORT_LIMIT: i64 = 100;
const MAX_EXPORT_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub repo: ArchiveRepository,
    pub orchestrator: Arc<RunOrchestrator>,
    pub api_token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/backup", get(trigger_backup))
        .route("/api/v1/healthz", get(healthz))
        .route("/api/v1/backup", post(trigger_backup))
        .route("/api/v1/status", get(status))
        .route("/api/v1/exports", get(list_exports))
        .route("/api/v1/lock/reset", post(reset_lock))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

fn require_api_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.api_token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    status: &'static str,
}

/// Acknowledges immediately; the run's outcome is only visible in logs and status.
async fn trigger_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TriggerResponse>), StatusCode> {
    require_api_auth(&state, &headers)?;
    info!("manual backup triggered");
    state.orchestrator.trigger(TriggerSource::Manual);
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { status: "started" })))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    state: RunState,
    lock: LockState,
    exported_count: i64,
    last_run: Option<RunReport>,
}

async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let lock = state.repo.lock().lock_state().await.map_err(|e| {
        error!(error = %format!("{e:#}"), "failed to read lock state");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let exported_count = state.repo.ledger().count_exported().await.map_err(|e| {
        error!(error = %format!("{e:#}"), "failed to count exported files");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(StatusResponse {
        state: state.orchestrator.state(),
        lock,
        exported_count,
        last_run: state.orchestrator.last_run(),
    }))
}

#[derive(Debug, Deserialize)]
struct ExportsQuery {
    limit: Option<i64>,
}

async fn list_exports(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ExportsQuery>,
) -> Result<Json<Vec<ExportedFile>>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EXPORT_LIMIT)
        .clamp(1, MAX_EXPORT_LIMIT);
    let rows = state.repo.ledger().list_exported(limit).await.map_err(|e| {
        error!(error = %format!("{e:#}"), "failed to list exported files");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(rows))
}

/// Operator recovery for a lock left held by a crashed process.
async fn reset_lock(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<LockState>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let lock = state.repo.lock();
    let before = lock.lock_state().await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    lock.force_release()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    warn!(previous_owner = ?before.owner, "backup lock force-released by operator");
    let after = lock.lock_state().await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(after))
}
