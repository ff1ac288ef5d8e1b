//! Health check endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Router;
use axum::routing::get;
use flowline_core::id::Id;
use serde_json::{Value, json};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Readiness probes the event log with a cheap, harmless lookup against a
/// sentinel id rather than a bare connection ping, so a reachable-but-broken
/// schema also fails the check.
async fn ready(State(state): State<AppState>) -> Response {
    match state.events.first_playbook_initialized(Id::from_raw(0)).await {
        Ok(_) => Json(json!({ "status": "ready" })).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "not_ready" }))).into_response()
        }
    }
}
