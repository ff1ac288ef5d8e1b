//! Bounded, TTL'd memoization for derived execution state and parsed
//! playbooks (§4.5, §5). Eviction is best-effort: the state cache can
//! always be refilled by replaying the event log, and the playbook cache
//! by re-resolving from the catalog.

use std::sync::Arc;
use std::time::Duration;

use flowline_core::id::Id;
use flowline_core::playbook::Playbook;
use flowline_core::state::ExecutionState;
use moka::future::Cache;
use tokio::sync::Mutex;

/// One entry per in-flight execution. The `Mutex` is the logical
/// per-execution critical section §5 requires: `handle_event` holds it
/// for the duration of a single dispatch.
#[derive(Clone)]
pub struct StateCache {
    inner: Cache<Id, Arc<Mutex<ExecutionState>>>,
}

impl StateCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn get(&self, execution_id: Id) -> Option<Arc<Mutex<ExecutionState>>> {
        self.inner.get(&execution_id).await
    }

    pub async fn insert(&self, execution_id: Id, state: ExecutionState) -> Arc<Mutex<ExecutionState>> {
        let handle = Arc::new(Mutex::new(state));
        self.inner.insert(execution_id, handle.clone()).await;
        handle
    }

    /// Drop a completed execution's entry; E can always rebuild it if it
    /// is ever needed again, but there's no reason to hold the memory.
    pub async fn evict(&self, execution_id: Id) {
        self.inner.invalidate(&execution_id).await;
    }
}

#[derive(Clone)]
pub struct PlaybookCache {
    inner: Cache<String, Arc<Playbook>>,
}

impl PlaybookCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Playbook>> {
        self.inner.get(key).await
    }

    pub async fn insert(&self, key: String, playbook: Arc<Playbook>) {
        self.inner.insert(key, playbook).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_cache_round_trips_and_evicts() {
        let cache = StateCache::new(10, Duration::from_secs(60));
        let id = Id::from_raw(1);
        cache.insert(id, ExecutionState::default()).await;
        assert!(cache.get(id).await.is_some());
        cache.evict(id).await;
        assert!(cache.get(id).await.is_none());
    }
}
