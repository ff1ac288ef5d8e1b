//! Shared domain errors and the tool-failure classification taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of tool-failure classifications. Each classification carries
/// a retryability verdict that must survive unchanged into rendered
/// `outcome.error.retryable` expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    RateLimit,
    Auth,
    NotFound,
    ClientError,
    ServerError,
    Schema,
    Parse,
    Transform,
    DbConnection,
    DbConstraint,
    DbDeadlock,
    DbTimeout,
    StorageQuota,
    StorageAccess,
    Unknown,
}

impl ErrorKind {
    /// Whether a failure of this kind is worth retrying at all, independent
    /// of attempt budget.
    pub fn default_retryable(self) -> bool {
        use ErrorKind::*;
        matches!(
            self,
            Connection
                | Timeout
                | RateLimit
                | ServerError
                | DbDeadlock
                | DbConnection
                | DbTimeout
                | StorageAccess
        )
    }
}

/// The structured error surfaced in a task `Outcome` (see the worker
/// crate) and, failing the whole step, in `call.error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub code: String,
    pub message: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pg_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            retryable: kind.default_retryable(),
            kind,
            code: code.into(),
            message: message.into(),
            source: source.into(),
            http_status: None,
            retry_after: None,
            pg_code: None,
            exception_type: None,
        }
    }

    /// Classify an HTTP response status into the taxonomy.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            429 => ErrorKind::RateLimit,
            401 | 403 => ErrorKind::Auth,
            404 => ErrorKind::NotFound,
            400..=499 => ErrorKind::ClientError,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        };
        let retryable = status == 429 || (500..=599).contains(&status);
        let mut e = Self::new(kind, format!("HTTP_{status}"), message, "http");
        e.retryable = retryable;
        e.http_status = Some(status);
        e
    }

    /// Classify a Postgres SQLSTATE code into the taxonomy.
    pub fn from_pg_sqlstate(sqlstate: &str, message: impl Into<String>) -> Self {
        let kind = match sqlstate {
            "40P01" => ErrorKind::DbDeadlock,
            "40001" => ErrorKind::DbDeadlock,
            s if s.starts_with("23") => ErrorKind::DbConstraint,
            s if s.starts_with("08") => ErrorKind::DbConnection,
            "57014" => ErrorKind::DbTimeout,
            _ => ErrorKind::Unknown,
        };
        let mut e = Self::new(kind, format!("PG_{sqlstate}"), message, "postgres");
        e.pg_code = Some(sqlstate.to_string());
        e
    }

    /// Classify a worker-side (Python tool) exception type into the taxonomy.
    pub fn from_python_exception(exception_type: &str, message: impl Into<String>) -> Self {
        let kind = match exception_type {
            "TimeoutError" => ErrorKind::Timeout,
            "ValueError" | "JSONDecodeError" => ErrorKind::Parse,
            "SchemaError" | "ValidationError" => ErrorKind::Schema,
            _ => ErrorKind::Unknown,
        };
        let mut e = Self::new(kind, format!("PY_{exception_type}"), message, "python");
        e.exception_type = Some(exception_type.to_string());
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_503_is_retryable_server_error() {
        let e = TaskError::from_http_status(503, "service unavailable");
        assert_eq!(e.kind, ErrorKind::ServerError);
        assert!(e.retryable);
    }

    #[test]
    fn http_404_is_not_retryable() {
        let e = TaskError::from_http_status(404, "missing");
        assert_eq!(e.kind, ErrorKind::NotFound);
        assert!(!e.retryable);
    }

    #[test]
    fn pg_deadlock_is_retryable() {
        let e = TaskError::from_pg_sqlstate("40P01", "deadlock detected");
        assert_eq!(e.kind, ErrorKind::DbDeadlock);
        assert!(e.retryable);
    }
}
