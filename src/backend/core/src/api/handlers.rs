//! API request handlers with proper error propagation.
//!
//! All handlers return `Result<impl IntoResponse, ReindexError>` so that
//! errors are converted to HTTP status codes by the `IntoResponse` impl on
//! `ReindexError`.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::middleware::split_list;
use super::{ApiResponse, AppState};
use crate::error::{ReindexError, Result};
use crate::jobs::engine::{RetryCommand, SubmitCommand};
use crate::jobs::history::HistoryFilter;
use crate::jobs::retry_queue::{QueueFilter, QueueId, QueueStatus, RetryMode};
use crate::jobs::task::{ReindexScope, ScopeInput, TaskId, TaskStatus};
use crate::observability::trace::TraceLink;

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Set on an audit export that lacks records.
pub const AUDIT_MISSING_HEADER: &str = "x-audit-missing-records";

fn require_actor(actor: &str) -> Result<String> {
    let actor = actor.trim();
    if actor.is_empty() {
        return Err(ReindexError::validation("actor must not be empty"));
    }
    Ok(actor.to_string())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.engine.stats();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "queue_depth": stats.queue_depth,
        "running_tasks": stats.running_tasks,
        "total_tasks": stats.total_tasks,
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Submission
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct SubmitReindexRequest {
    #[serde(default)]
    pub scope: ScopeInput,
    pub actor: String,
    pub note: Option<String>,
    pub trace_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitReindexResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub scope: ReindexScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceLink>,
}

pub async fn submit_reindex(
    State(state): State<AppState>,
    Json(req): Json<SubmitReindexRequest>,
) -> Result<impl IntoResponse> {
    let scope = ReindexScope::try_from(req.scope)?;
    let actor = require_actor(&req.actor)?;

    let mut command = SubmitCommand::new(scope, actor);
    if let Some(note) = req.note {
        command = command.with_note(note);
    }
    if let Some(trace_id) = req.trace_id.filter(|t| !t.trim().is_empty()) {
        command = command.with_trace_id(trace_id);
    }

    let task = state.engine.submit(command)?;
    let response = SubmitReindexResponse {
        task_id: task.task_id,
        status: task.status,
        scope: task.scope,
        trace: task.trace,
    };

    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(response))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// History
// ═══════════════════════════════════════════════════════════════════════════════

/// `?status=failed,partial&q=news`
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub q: Option<String>,
}

pub async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse> {
    let mut filter = HistoryFilter::new();
    for raw in split_list(query.status.as_deref()) {
        filter = filter.with_status(raw.parse::<TaskStatus>()?);
    }
    if let Some(q) = query.q {
        filter = filter.with_search(q);
    }

    Ok(Json(ApiResponse::success(state.engine.history(&filter))))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let history = state.engine.task(TaskId(id))?;
    Ok(Json(ApiResponse::success(history)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Queue
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn list_queue(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse> {
    let mut filter = QueueFilter::new();
    for raw in split_list(query.status.as_deref()) {
        filter = filter.with_status(raw.parse::<QueueStatus>()?);
    }
    if let Some(q) = query.q {
        filter = filter.with_search(q);
    }

    Ok(Json(ApiResponse::success(state.engine.list_queue(&filter))))
}

pub async fn get_queue_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let view = state.engine.queue_entry(QueueId(id))?;
    Ok(Json(ApiResponse::success(view)))
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub actor: String,
    pub note: Option<String>,
    #[serde(default)]
    pub force: bool,
}

pub async fn retry_queue_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RetryRequest>,
) -> Result<impl IntoResponse> {
    let mut command = RetryCommand::new(require_actor(&req.actor)?);
    if let Some(note) = req.note {
        command = command.with_note(note);
    }
    if req.force {
        command = command.forced();
    }

    let entry = state.engine.retry(QueueId(id), command)?;
    Ok(Json(ApiResponse::success(entry.view(state.engine.now()))))
}

#[derive(Debug, Deserialize)]
pub struct SetModeRequest {
    pub retry_mode: RetryMode,
    pub actor: String,
}

pub async fn set_retry_mode(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SetModeRequest>,
) -> Result<impl IntoResponse> {
    let actor = require_actor(&req.actor)?;
    let view = state.engine.set_retry_mode(QueueId(id), req.retry_mode, &actor)?;
    Ok(Json(ApiResponse::success(view)))
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    pub actor: Option<String>,
}

pub async fn remove_queue_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<RemoveQuery>,
) -> Result<impl IntoResponse> {
    state.engine.remove(QueueId(id), query.actor.as_deref())?;
    Ok(StatusCode::NO_CONTENT)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Audit
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn export_audit(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let export = state.engine.export_audit()?;
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
    if !export.is_complete() {
        headers.insert(AUDIT_MISSING_HEADER, HeaderValue::from(export.missing));
    }
    Ok((headers, export.body))
}
