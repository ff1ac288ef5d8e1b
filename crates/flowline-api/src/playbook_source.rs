//! Filesystem-backed `PlaybookSource`: playbooks are pre-parsed JSON
//! documents dropped into a directory, keyed by path relative to its
//! root. YAML parsing and catalog storage are external collaborators
//! (§1 Non-goals); this loader only has to consume validated objects.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use flowline_core::id::Id;
use flowline_core::playbook::Playbook;
use flowline_engine::{EngineError, EngineResult, PlaybookSource};
use moka::future::Cache;

pub struct FsPlaybookSource {
    root: PathBuf,
    cache: Cache<String, Arc<Playbook>>,
}

impl FsPlaybookSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Cache::builder().max_capacity(500).build(),
        }
    }

    fn path_for(&self, path: &str) -> PathBuf {
        self.root.join(format!("{path}.json"))
    }
}

#[async_trait]
impl PlaybookSource for FsPlaybookSource {
    async fn resolve(&self, _catalog_id: Option<Id>, path: Option<&str>) -> EngineResult<Arc<Playbook>> {
        let path = path.ok_or(EngineError::NoEntryStep)?;
        if let Some(cached) = self.cache.get(path).await {
            return Ok(cached);
        }
        let file = self.path_for(path);
        let raw = tokio::fs::read(&file)
            .await
            .map_err(|e| EngineError::UnknownStep(format!("reading {}: {e}", file.display())))?;
        let playbook: Playbook = serde_json::from_slice(&raw)
            .map_err(|e| EngineError::UnknownStep(format!("parsing {}: {e}", file.display())))?;
        let playbook = Arc::new(playbook);
        self.cache.insert(path.to_string(), playbook.clone()).await;
        Ok(playbook)
    }
}
