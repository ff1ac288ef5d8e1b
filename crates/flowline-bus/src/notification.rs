//! Notification Bus (C): durable pub/sub wake-up channel over NATS
//! JetStream. The authoritative command payload always lives in the
//! Command Store — a notification only tells a worker pool "something is
//! claimable", and duplicates must be tolerated.

use async_nats::jetstream::{self, consumer::PullConsumer};
use async_trait::async_trait;
use flowline_core::id::Id;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{BusError, BusResult};

/// Wire payload published on the bus (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub execution_id: Id,
    pub queue_id: Id,
    pub step: String,
    pub server_url: String,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub stream_name: String,
    pub subject: String,
    pub consumer_name: String,
    pub max_deliver: i64,
    pub ack_wait: Duration,
    pub retention: Duration,
    pub max_in_flight: i64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            stream_name: "FLOWLINE_COMMANDS".into(),
            subject: "flowline.commands".into(),
            consumer_name: "flowline-worker-pool".into(),
            max_deliver: 3,
            ack_wait: Duration::from_secs(30),
            retention: Duration::from_secs(3600),
            max_in_flight: 64,
        }
    }
}

#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, notification: &Notification) -> BusResult<()>;
}

pub struct NatsNotificationBus {
    jetstream: jetstream::Context,
    config: BusConfig,
}

impl NatsNotificationBus {
    pub async fn connect(url: &str, config: BusConfig) -> BusResult<Self> {
        let client = async_nats::connect(url).await?;
        let jetstream = jetstream::new(client);
        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream_name.clone(),
                subjects: vec![config.subject.clone()],
                max_age: config.retention,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Jetstream(e.to_string()))?;
        Ok(Self { jetstream, config })
    }

    /// Durable pull consumer matching the binding configuration: explicit
    /// ack, bounded redelivery, per-consumer max-in-flight.
    pub async fn consumer(&self) -> BusResult<PullConsumer> {
        let stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| BusError::Jetstream(e.to_string()))?;
        let consumer = stream
            .get_or_create_consumer(
                &self.config.consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(self.config.consumer_name.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    max_deliver: self.config.max_deliver,
                    ack_wait: self.config.ack_wait,
                    max_ack_pending: self.config.max_in_flight,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Jetstream(e.to_string()))?;
        Ok(consumer)
    }

    /// Fetch-and-dispatch loop: calls `handler` for each notification,
    /// acking on success and naking on error so the broker redelivers.
    pub async fn run<F, Fut>(&self, batch_size: usize, mut handler: F) -> BusResult<()>
    where
        F: FnMut(Notification) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let consumer = self.consumer().await?;
        loop {
            let mut messages = consumer
                .fetch()
                .max_messages(batch_size)
                .messages()
                .await
                .map_err(|e| BusError::Jetstream(e.to_string()))?;
            while let Some(message) = messages.next().await {
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(error = %e, "notification bus delivery error");
                        continue;
                    }
                };
                let notification: Notification = match serde_json::from_slice(&message.payload) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable notification, acking to drop");
                        let _ = message.ack().await;
                        continue;
                    }
                };
                if handler(notification).await {
                    let _ = message.ack().await;
                } else {
                    let _ = message.ack_with(jetstream::AckKind::Nak(None)).await;
                }
            }
        }
    }
}

#[async_trait]
impl NotificationPublisher for NatsNotificationBus {
    async fn publish(&self, notification: &Notification) -> BusResult<()> {
        let payload = serde_json::to_vec(notification)?;
        self.jetstream
            .publish(self.config.subject.clone(), payload.into())
            .await
            .map_err(|e| BusError::Jetstream(e.to_string()))?
            .await
            .map_err(|e| BusError::Jetstream(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_binding_contract() {
        let config = BusConfig::default();
        assert_eq!(config.max_deliver, 3);
        assert_eq!(config.ack_wait, Duration::from_secs(30));
        assert!(config.retention >= Duration::from_secs(3600));
    }
}
