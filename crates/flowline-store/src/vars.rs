//! Transient Variable Store (I): execution-scoped mutable variables.
//!
//! Coordinator-side direct access only. Workers never reach this store
//! directly — they go through the coordinator's HTTP façade (§4.9), which
//! in turn calls through this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_core::id::Id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

use crate::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    UserDefined,
    StepResult,
    Computed,
    IteratorState,
}

impl VarKind {
    fn as_str(self) -> &'static str {
        match self {
            VarKind::UserDefined => "user_defined",
            VarKind::StepResult => "step_result",
            VarKind::Computed => "computed",
            VarKind::IteratorState => "iterator_state",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "step_result" => VarKind::StepResult,
            "computed" => VarKind::Computed,
            "iterator_state" => VarKind::IteratorState,
            _ => VarKind::UserDefined,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransientVar {
    pub execution_id: Id,
    pub name: String,
    pub value: Value,
    pub kind: VarKind,
    pub source_step: Option<String>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct VarRow {
    execution_id: i64,
    name: String,
    value: Value,
    kind: String,
    source_step: Option<String>,
    accessed_at: DateTime<Utc>,
    access_count: i64,
}

impl From<VarRow> for TransientVar {
    fn from(row: VarRow) -> Self {
        TransientVar {
            execution_id: Id::from_raw(row.execution_id),
            name: row.name,
            value: row.value,
            kind: VarKind::parse(&row.kind),
            source_step: row.source_step,
            accessed_at: row.accessed_at,
            access_count: row.access_count,
        }
    }
}

#[async_trait]
pub trait TransientVarStore: Send + Sync {
    async fn set(
        &self,
        execution_id: Id,
        name: &str,
        value: Value,
        kind: VarKind,
        source_step: Option<&str>,
    ) -> StoreResult<()>;
    async fn get(&self, execution_id: Id, name: &str) -> StoreResult<Option<TransientVar>>;
    async fn list(&self, execution_id: Id) -> StoreResult<Vec<TransientVar>>;
    async fn delete(&self, execution_id: Id, name: &str) -> StoreResult<()>;
    async fn cleanup(&self, execution_id: Id) -> StoreResult<u64>;
}

pub struct PgTransientVarStore {
    pool: PgPool,
}

impl PgTransientVarStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransientVarStore for PgTransientVarStore {
    async fn set(
        &self,
        execution_id: Id,
        name: &str,
        value: Value,
        kind: VarKind,
        source_step: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transient_vars (execution_id, name, value, kind, source_step, accessed_at, access_count)
            VALUES ($1, $2, $3, $4, $5, NOW(), 0)
            ON CONFLICT (execution_id, name) DO UPDATE
            SET value = EXCLUDED.value, kind = EXCLUDED.kind, source_step = EXCLUDED.source_step
            "#,
        )
        .bind(execution_id.as_i64())
        .bind(name)
        .bind(value)
        .bind(kind.as_str())
        .bind(source_step)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, execution_id: Id, name: &str) -> StoreResult<Option<TransientVar>> {
        let row = sqlx::query_as::<_, VarRow>(
            r#"
            UPDATE transient_vars
            SET accessed_at = NOW(), access_count = access_count + 1
            WHERE execution_id = $1 AND name = $2
            RETURNING *
            "#,
        )
        .bind(execution_id.as_i64())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TransientVar::from))
    }

    async fn list(&self, execution_id: Id) -> StoreResult<Vec<TransientVar>> {
        let rows = sqlx::query_as::<_, VarRow>(
            "SELECT * FROM transient_vars WHERE execution_id = $1 ORDER BY name",
        )
        .bind(execution_id.as_i64())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TransientVar::from).collect())
    }

    async fn delete(&self, execution_id: Id, name: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM transient_vars WHERE execution_id = $1 AND name = $2")
            .bind(execution_id.as_i64())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup(&self, execution_id: Id) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM transient_vars WHERE execution_id = $1")
            .bind(execution_id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
