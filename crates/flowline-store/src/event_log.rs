//! Event Log (A): the append-only, single source of truth.
//!
//! Grounded in the same `sqlx`-over-`PgPool` repository shape used
//! throughout this store; the row layout follows the bit-stable column
//! set every implementation of this engine must agree on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_core::event::{Event, EventMeta, EventName, EventStatus, NewEvent};
use flowline_core::id::Id;
use serde_json::Value;
use sqlx::PgPool;

use crate::{StoreError, StoreResult};

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    execution_id: i64,
    event_id: i64,
    parent_event_id: Option<i64>,
    parent_execution_id: Option<i64>,
    catalog_id: Option<i64>,
    event_type: String,
    node_name: Option<String>,
    status: String,
    context: Option<Value>,
    result: Option<Value>,
    error: Option<Value>,
    stack_trace: Option<String>,
    worker_id: Option<String>,
    duration: Option<i64>,
    meta: Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let name = EventName::parse(&row.event_type)
            .ok_or_else(|| StoreError::NotFound(format!("unknown event_type {}", row.event_type)))?;
        let status = EventStatus::parse(&row.status)
            .ok_or_else(|| StoreError::NotFound(format!("unknown status {}", row.status)))?;
        let meta: EventMeta = serde_json::from_value(row.meta).unwrap_or_default();
        Ok(Event {
            execution_id: Id::from_raw(row.execution_id),
            event_id: Id::from_raw(row.event_id),
            parent_event_id: row.parent_event_id.map(Id::from_raw),
            parent_execution_id: row.parent_execution_id.map(Id::from_raw),
            catalog_id: row.catalog_id.map(Id::from_raw),
            name,
            step: row.node_name,
            status,
            context: row.context,
            result: row.result,
            error: row.error,
            stack_trace: row.stack_trace,
            worker_id: row.worker_id,
            duration_ms: row.duration,
            meta,
            created_at: row.created_at,
        })
    }
}

/// Filters accepted by `read` (§4.1).
#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    pub event_type: Option<EventName>,
    pub since_event_id: Option<Id>,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: NewEvent) -> StoreResult<Id>;
    async fn read(&self, execution_id: Id, filter: EventFilter, page: i64, page_size: i64) -> StoreResult<Vec<Event>>;
    async fn first_playbook_initialized(&self, execution_id: Id) -> StoreResult<Option<Event>>;
    /// Count `command.issued` not yet matched by `step.exit`, per step —
    /// the fallback-only pending-detection path when `issued_steps` is
    /// empty in the in-memory state (§4.7.1 step 11).
    async fn count_unmatched_issued(&self, execution_id: Id) -> StoreResult<Vec<String>>;
    /// Executions whose earliest `playbook.initialized` predates `older_than`
    /// and that carry no terminal lifecycle event yet (§4.7.7 cleanup sweep).
    async fn find_stale_executions(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<Id>>;
}

pub struct PgEventLog {
    pool: PgPool,
    ids: flowline_core::id::IdGenerator,
}

impl PgEventLog {
    pub fn new(pool: PgPool, worker_id: i64) -> Self {
        Self {
            pool,
            ids: flowline_core::id::IdGenerator::new(worker_id),
        }
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(&self, event: NewEvent) -> StoreResult<Id> {
        let event_id = self.ids.next();
        let meta = serde_json::to_value(&event.meta).unwrap_or(Value::Null);
        sqlx::query(
            r#"
            INSERT INTO event_log (
                execution_id, event_id, parent_event_id, parent_execution_id, catalog_id,
                event_type, node_name, status, context, result, error, stack_trace,
                worker_id, duration, meta, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15, NOW())
            "#,
        )
        .bind(event.execution_id.as_i64())
        .bind(event_id.as_i64())
        .bind(event.parent_event_id.map(|i| i.as_i64()))
        .bind(event.parent_execution_id.map(|i| i.as_i64()))
        .bind(event.catalog_id.map(|i| i.as_i64()))
        .bind(event.name.as_str())
        .bind(event.step)
        .bind(event.status.as_str())
        .bind(event.context)
        .bind(event.result)
        .bind(event.error)
        .bind(event.stack_trace)
        .bind(event.worker_id)
        .bind(event.duration_ms)
        .bind(meta)
        .execute(&self.pool)
        .await?;
        Ok(event_id)
    }

    async fn read(&self, execution_id: Id, filter: EventFilter, page: i64, page_size: i64) -> StoreResult<Vec<Event>> {
        let page_size = page_size.clamp(1, 500);
        let offset = (page.max(1) - 1) * page_size;
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT * FROM event_log
            WHERE execution_id = $1
              AND ($2::text IS NULL OR event_type = $2)
              AND ($3::bigint IS NULL OR event_id > $3)
            ORDER BY event_id ASC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(execution_id.as_i64())
        .bind(filter.event_type.map(|e| e.as_str()))
        .bind(filter.since_event_id.map(|i| i.as_i64()))
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Event::try_from).collect()
    }

    async fn first_playbook_initialized(&self, execution_id: Id) -> StoreResult<Option<Event>> {
        let row = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM event_log WHERE execution_id = $1 AND event_type = 'playbook.initialized' ORDER BY event_id ASC LIMIT 1",
        )
        .bind(execution_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Event::try_from).transpose()
    }

    async fn count_unmatched_issued(&self, execution_id: Id) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT node_name FROM event_log
            WHERE execution_id = $1 AND event_type = 'command.issued' AND node_name IS NOT NULL
            EXCEPT
            SELECT node_name FROM event_log
            WHERE execution_id = $1 AND event_type = 'step.exit' AND node_name IS NOT NULL
            "#,
        )
        .bind(execution_id.as_i64())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    async fn find_stale_executions(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<Id>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT e.execution_id FROM event_log e
            WHERE e.event_type = 'playbook.initialized' AND e.created_at < $1
              AND NOT EXISTS (
                SELECT 1 FROM event_log t
                WHERE t.execution_id = e.execution_id
                  AND t.event_type IN ('playbook.completed', 'playbook.failed', 'execution.cancelled')
              )
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| Id::from_raw(id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_name_round_trips_through_as_str_and_parse() {
        for name in [
            EventName::PlaybookInitialized,
            EventName::CommandIssued,
            EventName::CallDone,
            EventName::LoopDone,
        ] {
            assert_eq!(EventName::parse(name.as_str()), Some(name));
        }
    }
}
