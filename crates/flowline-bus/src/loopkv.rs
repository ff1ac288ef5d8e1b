//! Distributed Loop KV (D): low-latency keyed loop-progress counters with
//! atomic claim/increment, backed by a NATS JetStream KV bucket. Falls
//! back to an in-process `DashMap` when the bucket is unreachable —
//! correct only when a single coordinator process is the sole writer.

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use dashmap::DashMap;
use flowline_core::id::Id;
use serde::{Deserialize, Serialize};

use crate::{BusError, BusResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopKey {
    pub execution_id: Id,
    pub step_name: String,
    pub event_id: Id,
}

impl LoopKey {
    fn bucket_key(&self) -> String {
        format!(
            "{}.{}.{}",
            self.execution_id.as_i64(),
            self.step_name.replace('.', "_"),
            self.event_id.as_i64()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopCounters {
    pub collection_size: u32,
    pub completed_count: u32,
    pub scheduled_count: u32,
    pub iterator: String,
    pub mode: LoopMode,
    pub event_id: Id,
}

#[async_trait]
pub trait LoopKv: Send + Sync {
    async fn get(&self, key: &LoopKey) -> BusResult<Option<LoopCounters>>;
    async fn set(&self, key: &LoopKey, value: LoopCounters) -> BusResult<()>;
    /// Atomically claims the smallest `scheduled_count` under
    /// `collection_size` with `scheduled_count - completed_count <
    /// max_in_flight`, then increments `scheduled_count`. `None` means no
    /// slot is currently available (back-pressure, §4.7.3 step 5).
    async fn claim_next_loop_index(&self, key: &LoopKey, collection_size: u32, max_in_flight: u32) -> BusResult<Option<u32>>;
    /// Atomically increments `completed_count`, returning the new value,
    /// or `-1` if the key is absent.
    async fn increment_loop_completed(&self, key: &LoopKey) -> BusResult<i64>;
}

/// NATS JetStream KV-backed implementation. Atomicity is achieved via
/// optimistic concurrency: read the current revision, compute the new
/// value, and `update` conditioned on that revision; retry on conflict.
pub struct NatsLoopKv {
    store: kv::Store,
}

impl NatsLoopKv {
    pub async fn connect(url: &str, bucket: &str) -> BusResult<Self> {
        let client = async_nats::connect(url).await?;
        let js = jetstream::new(client);
        let store = js
            .create_key_value(kv::Config {
                bucket: bucket.to_string(),
                history: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Kv(e.to_string()))?;
        Ok(Self { store })
    }

    async fn read_with_revision(&self, key: &str) -> BusResult<Option<(LoopCounters, u64)>> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| BusError::Kv(e.to_string()))?;
        match entry {
            Some(e) => {
                let counters: LoopCounters = serde_json::from_slice(&e.value)?;
                Ok(Some((counters, e.revision)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl LoopKv for NatsLoopKv {
    async fn get(&self, key: &LoopKey) -> BusResult<Option<LoopCounters>> {
        Ok(self.read_with_revision(&key.bucket_key()).await?.map(|(c, _)| c))
    }

    async fn set(&self, key: &LoopKey, value: LoopCounters) -> BusResult<()> {
        let payload = serde_json::to_vec(&value)?;
        self.store
            .put(key.bucket_key(), payload.into())
            .await
            .map_err(|e| BusError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn claim_next_loop_index(&self, key: &LoopKey, collection_size: u32, max_in_flight: u32) -> BusResult<Option<u32>> {
        let bucket_key = key.bucket_key();
        for _ in 0..32 {
            let Some((mut counters, revision)) = self.read_with_revision(&bucket_key).await? else {
                return Ok(None);
            };
            if counters.scheduled_count >= collection_size
                || counters.scheduled_count.saturating_sub(counters.completed_count) >= max_in_flight
            {
                return Ok(None);
            }
            let claimed = counters.scheduled_count;
            counters.scheduled_count += 1;
            let payload = serde_json::to_vec(&counters)?;
            match self.store.update(&bucket_key, payload.into(), revision).await {
                Ok(_) => return Ok(Some(claimed)),
                Err(_) => continue, // lost the CAS race, retry
            }
        }
        Err(BusError::Kv(format!("exhausted CAS retries for {bucket_key}")))
    }

    async fn increment_loop_completed(&self, key: &LoopKey) -> BusResult<i64> {
        let bucket_key = key.bucket_key();
        for _ in 0..32 {
            let Some((mut counters, revision)) = self.read_with_revision(&bucket_key).await? else {
                return Ok(-1);
            };
            counters.completed_count += 1;
            let new_value = counters.completed_count as i64;
            let payload = serde_json::to_vec(&counters)?;
            match self.store.update(&bucket_key, payload.into(), revision).await {
                Ok(_) => return Ok(new_value),
                Err(_) => continue,
            }
        }
        Err(BusError::Kv(format!("exhausted CAS retries for {bucket_key}")))
    }
}

/// In-process fallback used when the NATS KV bucket is unreachable.
/// Correct only as the single writer (one coordinator process); callers
/// are responsible for that invariant per §4.4.
#[derive(Default)]
pub struct LocalLoopKv {
    entries: DashMap<String, LoopCounters>,
}

impl LocalLoopKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoopKv for LocalLoopKv {
    async fn get(&self, key: &LoopKey) -> BusResult<Option<LoopCounters>> {
        Ok(self.entries.get(&key.bucket_key()).map(|e| e.clone()))
    }

    async fn set(&self, key: &LoopKey, value: LoopCounters) -> BusResult<()> {
        self.entries.insert(key.bucket_key(), value);
        Ok(())
    }

    async fn claim_next_loop_index(&self, key: &LoopKey, collection_size: u32, max_in_flight: u32) -> BusResult<Option<u32>> {
        let mut entry = match self.entries.get_mut(&key.bucket_key()) {
            Some(e) => e,
            None => return Ok(None),
        };
        if entry.scheduled_count >= collection_size
            || entry.scheduled_count.saturating_sub(entry.completed_count) >= max_in_flight
        {
            return Ok(None);
        }
        let claimed = entry.scheduled_count;
        entry.scheduled_count += 1;
        Ok(Some(claimed))
    }

    async fn increment_loop_completed(&self, key: &LoopKey) -> BusResult<i64> {
        let mut entry = match self.entries.get_mut(&key.bucket_key()) {
            Some(e) => e,
            None => return Ok(-1),
        };
        entry.completed_count += 1;
        Ok(entry.completed_count as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LoopKey {
        LoopKey {
            execution_id: Id::from_raw(1),
            step_name: "fetch_all".into(),
            event_id: Id::from_raw(2),
        }
    }

    #[tokio::test]
    async fn claim_respects_max_in_flight() {
        let kv = LocalLoopKv::new();
        let k = key();
        kv.set(
            &k,
            LoopCounters {
                collection_size: 10,
                completed_count: 0,
                scheduled_count: 0,
                iterator: "item".into(),
                mode: LoopMode::Parallel,
                event_id: k.event_id,
            },
        )
        .await
        .unwrap();

        for expected in 0..3 {
            let claimed = kv.claim_next_loop_index(&k, 10, 3).await.unwrap();
            assert_eq!(claimed, Some(expected));
        }
        // fourth claim should be refused: 3 scheduled, 0 completed, bound is 3
        assert_eq!(kv.claim_next_loop_index(&k, 10, 3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_completed_unblocks_more_claims() {
        let kv = LocalLoopKv::new();
        let k = key();
        kv.set(
            &k,
            LoopCounters {
                collection_size: 2,
                completed_count: 0,
                scheduled_count: 1,
                iterator: "item".into(),
                mode: LoopMode::Parallel,
                event_id: k.event_id,
            },
        )
        .await
        .unwrap();
        assert_eq!(kv.claim_next_loop_index(&k, 2, 1).await.unwrap(), None);
        assert_eq!(kv.increment_loop_completed(&k).await.unwrap(), 1);
        assert_eq!(kv.claim_next_loop_index(&k, 2, 1).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn increment_on_absent_key_returns_negative_one() {
        let kv = LocalLoopKv::new();
        assert_eq!(kv.increment_loop_completed(&key()).await.unwrap(), -1);
    }
}
