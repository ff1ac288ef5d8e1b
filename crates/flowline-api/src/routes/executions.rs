//! `/executions` (§6): start, cancel, finalize, paginated read, cleanup.

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use flowline_core::event::EventName;
use flowline_core::id::Id;
use flowline_engine::PlaybookRef;
use flowline_store::EventFilter;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/executions", post(start_execution))
        .route("/executions/cleanup", post(cleanup))
        .route("/executions/{id}", get(read_events))
        .route("/executions/{id}/cancel", post(cancel))
        .route("/executions/{id}/cancellation-check", get(cancellation_check))
        .route("/executions/{id}/finalize", post(finalize))
}

#[derive(Debug, Deserialize)]
struct StartExecutionRequest {
    playbook_path: Option<String>,
    catalog_id: Option<String>,
    #[serde(default)]
    payload: Value,
    parent_execution_id: Option<String>,
}

async fn start_execution(
    State(state): State<AppState>,
    Json(req): Json<StartExecutionRequest>,
) -> Result<Json<Value>, ApiError> {
    let playbook_ref = match (req.catalog_id, req.playbook_path) {
        (Some(id), _) => PlaybookRef::CatalogId(parse_id(&id)?),
        (None, Some(path)) => PlaybookRef::Path(path),
        (None, None) => {
            return Err(ApiError::BadRequest(
                "one of catalog_id or playbook_path is required".into(),
            ))
        }
    };
    let parent_execution_id = req
        .parent_execution_id
        .as_deref()
        .map(parse_id)
        .transpose()?;

    let (execution_id, issued) = state
        .engine
        .start_execution(playbook_ref, req.payload, parent_execution_id)
        .await?;

    Ok(Json(json!({
        "execution_id": execution_id.to_string(),
        "status": "running",
        "commands_generated": issued.len(),
    })))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_page_size")]
    page_size: i64,
    since_event_id: Option<String>,
    event_type: Option<String>,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    100
}

async fn read_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let execution_id = parse_id(&id)?;
    let filter = EventFilter {
        event_type: q.event_type.as_deref().and_then(EventName::parse),
        since_event_id: q.since_event_id.as_deref().map(parse_id).transpose()?,
    };
    let page_size = q.page_size.clamp(1, 500);
    let events = state.events.read(execution_id, filter, q.page, page_size).await?;
    Ok(Json(json!({ "events": events, "page": q.page, "page_size": page_size })))
}

async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let execution_id = parse_id(&id)?;
    let cancelled = state.engine.cancel_execution(execution_id, true, None).await?;
    Ok(Json(json!({
        "status": "cancelled",
        "cancelled_executions": cancelled.iter().map(Id::to_string).collect::<Vec<_>>(),
    })))
}

async fn cancellation_check(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let execution_id = parse_id(&id)?;
    let filter = EventFilter {
        event_type: Some(EventName::ExecutionCancelled),
        since_event_id: None,
    };
    let events = state.events.read(execution_id, filter, 1, 1).await?;
    Ok(Json(json!({ "cancelled": !events.is_empty() })))
}

#[derive(Debug, Deserialize)]
struct FinalizeRequest {
    reason: Option<String>,
}

async fn finalize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FinalizeRequest>,
) -> Result<Json<Value>, ApiError> {
    let execution_id = parse_id(&id)?;
    // Finalizing a stuck execution is modelled as coordinator-initiated
    // cancellation: both append a terminal lifecycle event and evict the
    // cached state so the next read reconstructs cleanly.
    let affected = state.engine.cancel_execution(execution_id, false, req.reason).await?;
    Ok(Json(json!({ "status": "finalized", "executions": affected.iter().map(Id::to_string).collect::<Vec<_>>() })))
}

#[derive(Debug, Deserialize)]
struct CleanupRequest {
    #[serde(default = "default_older_than_minutes")]
    older_than_minutes: i64,
    #[serde(default)]
    dry_run: bool,
}

fn default_older_than_minutes() -> i64 {
    60
}

async fn cleanup(
    State(state): State<AppState>,
    Json(req): Json<CleanupRequest>,
) -> Result<Json<Value>, ApiError> {
    let older_than = chrono::Utc::now() - chrono::Duration::minutes(req.older_than_minutes);
    let swept = if req.dry_run {
        state.events.find_stale_executions(older_than).await?
    } else {
        state.engine.sweep_stale_executions(older_than).await?
    };
    Ok(Json(json!({
        "older_than_minutes": req.older_than_minutes,
        "dry_run": req.dry_run,
        "swept": swept.iter().map(Id::to_string).collect::<Vec<_>>(),
    })))
}

fn parse_id(s: &str) -> Result<Id, ApiError> {
    Id::from_str(s).map_err(|_| ApiError::BadRequest(format!("invalid id '{s}'")))
}
