//! `/vars` (§4.9, §6): the Transient Variable Store façade. Workers
//! never touch the backing table directly — this is the only door in.

use std::str::FromStr;

use axum::extract::{Path, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use flowline_core::id::Id;
use flowline_store::VarKind;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/vars/{execution_id}", get(list).post(set_unnamed))
        .route(
            "/vars/{execution_id}/{name}",
            get(get_var).post(set_var).delete(delete_var),
        )
}

#[derive(Debug, Deserialize)]
struct SetVarRequest {
    name: Option<String>,
    value: Value,
    #[serde(default)]
    kind: Option<String>,
    source_step: Option<String>,
}

fn parse_kind(s: Option<&str>) -> VarKind {
    match s {
        Some("step_result") => VarKind::StepResult,
        Some("computed") => VarKind::Computed,
        Some("iterator_state") => VarKind::IteratorState,
        _ => VarKind::UserDefined,
    }
}

async fn list(State(state): State<AppState>, Path(execution_id): Path<String>) -> Result<Json<Value>, ApiError> {
    let execution_id = parse_id(&execution_id)?;
    let vars = state.vars.list(execution_id).await?;
    Ok(Json(json!({ "vars": vars })))
}

/// `POST /vars/{execution_id}` with a `name` field in the body — used by
/// callers that don't have the name in the URL path yet.
async fn set_unnamed(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Json(req): Json<SetVarRequest>,
) -> Result<Json<Value>, ApiError> {
    let execution_id = parse_id(&execution_id)?;
    let name = req
        .name
        .ok_or_else(|| ApiError::BadRequest("name is required".into()))?;
    state
        .vars
        .set(execution_id, &name, req.value, parse_kind(req.kind.as_deref()), req.source_step.as_deref())
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn get_var(
    State(state): State<AppState>,
    Path((execution_id, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let execution_id = parse_id(&execution_id)?;
    let var = state
        .vars
        .get(execution_id, &name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("var '{name}' not set for execution {execution_id}")))?;
    Ok(Json(json!(var)))
}

async fn set_var(
    State(state): State<AppState>,
    Path((execution_id, name)): Path<(String, String)>,
    Json(req): Json<SetVarRequest>,
) -> Result<Json<Value>, ApiError> {
    let execution_id = parse_id(&execution_id)?;
    state
        .vars
        .set(execution_id, &name, req.value, parse_kind(req.kind.as_deref()), req.source_step.as_deref())
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn delete_var(
    State(state): State<AppState>,
    Path((execution_id, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let execution_id = parse_id(&execution_id)?;
    state.vars.delete(execution_id, &name).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

fn parse_id(s: &str) -> Result<Id, ApiError> {
    Id::from_str(s).map_err(|_| ApiError::BadRequest(format!("invalid id '{s}'")))
}
