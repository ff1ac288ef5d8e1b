//! Command Store (B): durable queue of pending/running commands.
//!
//! Claim uses `FOR UPDATE SKIP LOCKED` so concurrent coordinators never
//! observe the same row as claimable — the same pattern used for plain
//! job queues, generalized to single-claim-until-lease-expiry semantics.

use async_trait::async_trait;
use flowline_core::command::Command;
use flowline_core::id::Id;
use sqlx::PgPool;

use crate::{StoreError, StoreResult};

#[derive(Debug, sqlx::FromRow)]
struct CommandRow {
    command_id: i64,
    payload: serde_json::Value,
}

#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn publish(&self, command_id: Id, command: &Command) -> StoreResult<()>;
    async fn claim(&self, worker_id: &str) -> StoreResult<Option<(Id, Command)>>;
    /// Release a lease without completing the command, e.g. on worker
    /// crash recovery — the command becomes claimable again.
    async fn release_stale_leases(&self, older_than_secs: i64) -> StoreResult<u64>;
}

pub struct PgCommandStore {
    pool: PgPool,
}

impl PgCommandStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommandStore for PgCommandStore {
    async fn publish(&self, command_id: Id, command: &Command) -> StoreResult<()> {
        let payload = serde_json::to_value(command)
            .map_err(|e| StoreError::NotFound(format!("command serialize: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO command_store (command_id, execution_id, step, priority, status, payload, created_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, NOW())
            "#,
        )
        .bind(command_id.as_i64())
        .bind(command.execution_id.as_i64())
        .bind(&command.step)
        .bind(command.priority)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim(&self, worker_id: &str) -> StoreResult<Option<(Id, Command)>> {
        let row = sqlx::query_as::<_, CommandRow>(
            r#"
            UPDATE command_store
            SET status = 'claimed', claimed_by = $1, claimed_at = NOW()
            WHERE command_id = (
                SELECT command_id FROM command_store
                WHERE status = 'pending'
                ORDER BY priority DESC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING command_id, payload
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let command: Command = serde_json::from_value(row.payload)
            .map_err(|e| StoreError::NotFound(format!("command deserialize: {e}")))?;
        Ok(Some((Id::from_raw(row.command_id), command)))
    }

    async fn release_stale_leases(&self, older_than_secs: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE command_store
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL
            WHERE status = 'claimed' AND claimed_at < NOW() - ($1 || ' seconds')::interval
            "#,
        )
        .bind(older_than_secs.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
