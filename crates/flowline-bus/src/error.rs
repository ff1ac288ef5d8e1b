//! Errors for the NATS-backed notification bus and loop KV.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("connect error: {0}")]
    Connect(#[from] async_nats::ConnectError),

    #[error("publish error: {0}")]
    Publish(#[from] async_nats::PublishError),

    #[error("jetstream error: {0}")]
    Jetstream(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("key-value store error: {0}")]
    Kv(String),
}

pub type BusResult<T> = std::result::Result<T, BusError>;
