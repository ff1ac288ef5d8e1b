//! `POST /events` (§6): the worker-reported inbound event that drives
//! `Engine::handle_event` — the hot path.

use std::str::FromStr;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use flowline_core::event::{EventName, EventStatus};
use flowline_core::id::Id;
use flowline_engine::{EventStatus2, IncomingEvent};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/events", post(submit_event))
}

#[derive(Debug, Deserialize)]
struct EventRequest {
    execution_id: String,
    step: Option<String>,
    name: String,
    #[serde(default = "default_status")]
    status: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    worker_id: Option<String>,
    duration_ms: Option<i64>,
    loop_event_id: Option<String>,
    loop_iteration_index: Option<u32>,
}

fn default_status() -> String {
    "RUNNING".to_string()
}

async fn submit_event(
    State(state): State<AppState>,
    Json(req): Json<EventRequest>,
) -> Result<Json<Value>, ApiError> {
    let execution_id = Id::from_str(&req.execution_id)
        .map_err(|_| ApiError::BadRequest(format!("invalid execution_id '{}'", req.execution_id)))?;
    let name = EventName::parse(&req.name)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown event name '{}'", req.name)))?;
    let status = parse_status(&req.status)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown status '{}'", req.status)))?;
    let loop_event_id = req
        .loop_event_id
        .as_deref()
        .map(Id::from_str)
        .transpose()
        .map_err(|_| ApiError::BadRequest("invalid loop_event_id".into()))?;

    let incoming = IncomingEvent {
        execution_id,
        step: req.step,
        name: Some(name),
        status: EventStatus2(status),
        result: req.result,
        error: req.error,
        worker_id: req.worker_id,
        duration_ms: req.duration_ms,
        loop_event_id,
        loop_iteration_index: req.loop_iteration_index,
    };

    let issued = state.engine.handle_event(incoming).await?;
    Ok(Json(json!({
        "commands_generated": issued.len(),
        "commands": issued.iter().map(|c| json!({
            "command_id": c.command_id.to_string(),
            "step": c.command.step,
        })).collect::<Vec<_>>(),
    })))
}

fn parse_status(s: &str) -> Option<EventStatus> {
    match s.to_ascii_uppercase().as_str() {
        "RUNNING" => Some(EventStatus::Running),
        "COMPLETED" => Some(EventStatus::Completed),
        "FAILED" => Some(EventStatus::Failed),
        "CANCELLED" => Some(EventStatus::Cancelled),
        "SKIPPED" => Some(EventStatus::Skipped),
        _ => None,
    }
}
