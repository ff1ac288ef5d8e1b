//! HTTP façade client (§4.9, §6): workers never touch the event log,
//! command store row, or transient variable table directly — every
//! worker-originated write crosses this boundary.

use flowline_core::id::Id;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("coordinator request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("coordinator returned {status}: {body}")]
    Status { status: u16, body: String },
}

pub type ClientResult<T> = Result<T, ClientError>;

pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
    worker_id: String,
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            worker_id: worker_id.into(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> ClientResult<Value> {
        let response = self.http.post(format!("{}{path}", self.base_url)).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status: status.as_u16(), body });
        }
        Ok(response.json::<Value>().await.unwrap_or(Value::Null))
    }

    pub async fn emit_call_done(&self, execution_id: Id, step: &str, result: Value, duration_ms: i64) -> ClientResult<()> {
        self.post(
            "/events",
            json!({
                "execution_id": execution_id,
                "step": step,
                "name": "call.done",
                "status": "completed",
                "result": result,
                "worker_id": self.worker_id,
                "duration_ms": duration_ms,
            }),
        )
        .await?;
        self.post(
            "/events",
            json!({
                "execution_id": execution_id,
                "step": step,
                "name": "step.exit",
                "status": "completed",
                "result": result,
                "worker_id": self.worker_id,
                "duration_ms": duration_ms,
            }),
        )
        .await?;
        Ok(())
    }

    /// `step.enter`: the claim-time marker posted before dispatch, distinct
    /// from `call.done`/`call.error`'s `step.exit` (§8 S1).
    pub async fn emit_step_enter(&self, execution_id: Id, step: &str) -> ClientResult<()> {
        self.post(
            "/events",
            json!({
                "execution_id": execution_id,
                "step": step,
                "name": "step.enter",
                "status": "running",
                "worker_id": self.worker_id,
            }),
        )
        .await?;
        Ok(())
    }

    /// An intermediate (non-final) retry attempt: `call.error` without a
    /// paired `step.exit`, since the step is still in flight (§4.7.4).
    pub async fn emit_call_error_attempt(&self, execution_id: Id, step: &str, error: Value, duration_ms: i64) -> ClientResult<()> {
        self.post(
            "/events",
            json!({
                "execution_id": execution_id,
                "step": step,
                "name": "call.error",
                "status": "running",
                "error": error,
                "worker_id": self.worker_id,
                "duration_ms": duration_ms,
            }),
        )
        .await?;
        Ok(())
    }

    /// Poll whether `execution_id` has been cancelled, so a worker can
    /// abandon a long-running command instead of reporting into a dead
    /// execution (§4.7.6).
    pub async fn check_cancelled(&self, execution_id: Id) -> ClientResult<bool> {
        let response = self
            .http
            .get(format!("{}/executions/{execution_id}/cancellation-check", self.base_url))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status: status.as_u16(), body });
        }
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(body.get("cancelled").and_then(Value::as_bool).unwrap_or(false))
    }

    pub async fn emit_call_error(&self, execution_id: Id, step: &str, error: Value, duration_ms: i64) -> ClientResult<()> {
        self.post(
            "/events",
            json!({
                "execution_id": execution_id,
                "step": step,
                "name": "call.error",
                "status": "failed",
                "error": error,
                "worker_id": self.worker_id,
                "duration_ms": duration_ms,
            }),
        )
        .await?;
        self.post(
            "/events",
            json!({
                "execution_id": execution_id,
                "step": step,
                "name": "step.exit",
                "status": "failed",
                "error": error,
                "worker_id": self.worker_id,
                "duration_ms": duration_ms,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn get_var(&self, execution_id: Id, name: &str) -> ClientResult<Value> {
        let response = self.http.get(format!("{}/vars/{execution_id}/{name}", self.base_url)).send().await?;
        Ok(response.json::<Value>().await.unwrap_or(Value::Null))
    }

    pub async fn set_var(&self, execution_id: Id, name: &str, value: Value) -> ClientResult<()> {
        self.post(&format!("/vars/{execution_id}/{name}"), json!({ "value": value })).await?;
        Ok(())
    }
}
