use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as PathParam, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use entrega_core::{
    BusinessHours, ConfigStore, Engine, StartRequest, StopReason, StoreError, WebhookSender,
};

use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub store: Arc<ConfigStore>,
    pub webhook: Arc<WebhookSender>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/consume", post(consume))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/stop", post(stop))
        .route("/active-queues", get(active_queues))
        .route("/queue-info/:queue", get(queue_info))
        .route("/queues-info", post(queues_info))
        .route("/stats", get(stats))
        .route("/stats/reset", post(reset_stats))
        .route("/webhook/test", post(webhook_test))
        .route("/persisted-queues", get(persisted_queues))
        .route("/restore-queues", post(restore_queues))
        .route("/backup-configs", post(backup_configs))
        .route("/restore-backup", post(restore_backup))
        .route("/clear-configs", delete(clear_configs))
        .route("/cleanup-orphans", post(cleanup_orphans))
        .route("/persisted-queue/:queue", delete(delete_persisted_queue))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeBody {
    queue: String,
    webhook: String,
    min_interval: Option<u64>,
    max_interval: Option<u64>,
    business_hours: Option<BusinessHours>,
}

#[derive(Debug, Deserialize)]
struct QueueBody {
    queue: String,
}

#[derive(Debug, Deserialize)]
struct QueuesBody {
    queues: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookTestBody {
    url: String,
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BackupBody {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreBackupBody {
    backup_path: String,
}

async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.engine.stats().await?;
    let healthy = stats.initialized && stats.broker_connected;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "unavailable" },
            "initialized": stats.initialized,
            "brokerConnected": stats.broker_connected,
            "activeQueues": stats.active_queues,
        })),
    ))
}

#[instrument(skip(state))]
async fn consume(
    State(state): State<AppState>,
    Json(body): Json<ConsumeBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.queue.is_empty() {
        return Err(ApiError::bad_request("invalid_queue", "queue name must not be empty"));
    }
    state
        .engine
        .start_consuming(StartRequest {
            queue: body.queue.clone(),
            webhook_url: body.webhook,
            min_interval_ms: body.min_interval,
            max_interval_ms: body.max_interval,
            business_hours: body.business_hours,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "queue": body.queue, "message": "consumer started" })),
    ))
}

#[instrument(skip(state))]
async fn pause(
    State(state): State<AppState>,
    Json(body): Json<QueueBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.pause_consuming(&body.queue).await?;
    Ok(Json(json!({ "queue": body.queue, "status": "paused" })))
}

#[instrument(skip(state))]
async fn resume(
    State(state): State<AppState>,
    Json(body): Json<QueueBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.resume_consuming(&body.queue).await?;
    Ok(Json(json!({ "queue": body.queue, "status": "running" })))
}

#[instrument(skip(state))]
async fn stop(
    State(state): State<AppState>,
    Json(body): Json<QueueBody>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state
        .engine
        .stop_consuming(&body.queue, StopReason::Manual)
        .await?;
    Ok(Json(summary))
}

async fn active_queues(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.active_queues().await?))
}

async fn queue_info(
    State(state): State<AppState>,
    PathParam(queue): PathParam<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.queue_info(&queue).await?))
}

async fn queues_info(
    State(state): State<AppState>,
    Json(body): Json<QueuesBody>,
) -> Result<impl IntoResponse, ApiError> {
    let mut reports = Vec::with_capacity(body.queues.len());
    for queue in body.queues {
        match state.engine.queue_info(&queue).await {
            Ok(info) => reports.push(json!({ "queue": queue, "info": info })),
            Err(err) => reports.push(json!({ "queue": queue, "error": err.to_string() })),
        }
    }
    Ok(Json(reports))
}

async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.stats().await?))
}

async fn reset_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.engine.reset_stats().await?;
    Ok(Json(json!({ "message": "counters reset" })))
}

#[instrument(skip(state))]
async fn webhook_test(
    State(state): State<AppState>,
    Json(body): Json<WebhookTestBody>,
) -> impl IntoResponse {
    let report = state.webhook.test_webhook(&body.url, body.timeout).await;
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(report))
}

async fn persisted_queues(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let persisted = state.store.load_all().await?;
    let stats = state.store.stats().await?;
    Ok(Json(json!({ "persisted": persisted, "stats": stats })))
}

async fn restore_queues(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.restore_persisted().await?))
}

#[instrument(skip(state))]
async fn backup_configs(
    State(state): State<AppState>,
    Json(body): Json<BackupBody>,
) -> Result<impl IntoResponse, ApiError> {
    let target = state.store.backup(body.path.map(PathBuf::from)).await?;
    Ok(Json(json!({ "backupPath": target.display().to_string() })))
}

#[instrument(skip(state))]
async fn restore_backup(
    State(state): State<AppState>,
    Json(body): Json<RestoreBackupBody>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.restore(Path::new(&body.backup_path)).await {
        Ok(queues) => Ok(Json(json!({ "restored": queues }))),
        Err(StoreError::InvalidDocument(msg)) => {
            Err(ApiError::bad_request("invalid_backup", msg))
        }
        Err(err) => Err(err.into()),
    }
}

async fn clear_configs(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.store.clear().await?;
    Ok(Json(json!({ "message": "configuration store cleared" })))
}

/// Probe every stored queue at the broker and drop configs whose queue no
/// longer exists.
async fn cleanup_orphans(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stored = state.store.load_all().await?;
    let mut removed = Vec::new();
    let mut kept = 0usize;

    for queue in stored.keys() {
        match state.engine.queue_info(queue).await {
            Ok(_) => kept += 1,
            Err(entrega_core::QueueInfoError::QueueNotFound(_)) => {
                state.store.remove(queue).await?;
                removed.push(queue.clone());
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(Json(json!({ "removed": removed, "kept": kept })))
}

async fn delete_persisted_queue(
    State(state): State<AppState>,
    PathParam(queue): PathParam<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.remove(&queue).await? {
        Ok(Json(json!({ "queue": queue, "removed": true })))
    } else {
        Err(ApiError::not_found(format!("no persisted config for queue: {queue}")))
    }
}
