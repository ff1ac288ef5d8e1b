//! Application state.

use std::sync::Arc;

use flowline_engine::Engine;
use flowline_store::{EventLog, TransientVarStore};

/// Shared application state: the engine plus the two read paths
/// (`/executions/{id}` pagination and `/vars`) that bypass it.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub events: Arc<dyn EventLog>,
    pub vars: Arc<dyn TransientVarStore>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, events: Arc<dyn EventLog>, vars: Arc<dyn TransientVarStore>) -> Self {
        Self { engine, events, vars }
    }
}
