//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<flowline_core::Error> for ApiError {
    fn from(err: flowline_core::Error) -> Self {
        match err {
            flowline_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            flowline_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            flowline_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            flowline_core::Error::Cancelled => ApiError::Conflict("already cancelled".into()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<flowline_store::StoreError> for ApiError {
    fn from(err: flowline_store::StoreError) -> Self {
        match err {
            flowline_store::StoreError::NotFound(msg) => ApiError::NotFound(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<flowline_engine::EngineError> for ApiError {
    fn from(err: flowline_engine::EngineError) -> Self {
        match err {
            flowline_engine::EngineError::UnknownExecution(id) => {
                ApiError::NotFound(format!("execution {id} not found"))
            }
            flowline_engine::EngineError::UnknownStep(step) => {
                ApiError::BadRequest(format!("unknown step '{step}'"))
            }
            flowline_engine::EngineError::NoEntryStep => {
                ApiError::BadRequest("playbook has no entry step".into())
            }
            flowline_engine::EngineError::Store(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
