//! The structured result/error envelope a task call evaluates against
//! (§4.8): `{{ outcome.status }}`, `{{ outcome.error.retryable }}`, etc.

use flowline_core::error::TaskError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeMeta {
    pub attempt: u32,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub meta: OutcomeMeta,
}

impl Outcome {
    pub fn success(result: Value, attempt: u32, duration_ms: i64) -> Self {
        Self {
            status: OutcomeStatus::Success,
            result: Some(result),
            error: None,
            meta: OutcomeMeta { attempt, duration_ms },
        }
    }

    pub fn failure(error: TaskError, attempt: u32, duration_ms: i64) -> Self {
        Self {
            status: OutcomeStatus::Error,
            result: None,
            error: Some(error),
            meta: OutcomeMeta { attempt, duration_ms },
        }
    }

    pub fn to_render_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
