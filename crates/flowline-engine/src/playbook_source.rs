//! Playbook resolution is an external collaborator's concern (catalog
//! storage and YAML parsing are both out of scope); this trait is the
//! boundary contract the engine depends on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use flowline_core::id::Id;
use flowline_core::playbook::Playbook;

use crate::error::{EngineError, EngineResult};

#[async_trait]
pub trait PlaybookSource: Send + Sync {
    async fn resolve(&self, catalog_id: Option<Id>, path: Option<&str>) -> EngineResult<Arc<Playbook>>;
}

/// In-memory catalog keyed by path, used in tests and for single-process
/// deployments that preload playbooks rather than fetching from a store.
#[derive(Default)]
pub struct InMemoryPlaybookSource {
    by_path: std::sync::Mutex<HashMap<String, Arc<Playbook>>>,
}

impl InMemoryPlaybookSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, playbook: Playbook) {
        let path = playbook.metadata.path.clone();
        self.by_path
            .lock()
            .expect("playbook registry poisoned")
            .insert(path, Arc::new(playbook));
    }
}

#[async_trait]
impl PlaybookSource for InMemoryPlaybookSource {
    async fn resolve(&self, _catalog_id: Option<Id>, path: Option<&str>) -> EngineResult<Arc<Playbook>> {
        let path = path.ok_or_else(|| EngineError::NoEntryStep)?;
        self.by_path
            .lock()
            .expect("playbook registry poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStep(path.to_string()))
    }
}
