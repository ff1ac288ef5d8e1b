//! API routes.

pub mod events;
pub mod executions;
pub mod health;
pub mod vars;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(executions::router())
        .merge(events::router())
        .merge(vars::router())
        .merge(health::router())
        .with_state(state)
}
