//! Flowline worker process: polls the command store and runs tool calls.

use std::sync::Arc;

use flowline_bus::{BusConfig, NatsNotificationBus};
use flowline_store::{create_pool, PgCommandStore};
use flowline_worker::Worker;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let bus_url = std::env::var("FLOWLINE_BUS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string());
    let worker_id = std::env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", std::process::id()));

    let pool = create_pool(&database_url).await?;
    let command_store: Arc<dyn flowline_store::CommandStore> = Arc::new(PgCommandStore::new(pool));
    let bus = NatsNotificationBus::connect(&bus_url, BusConfig::default()).await?;

    let worker = Worker::new(worker_id, command_store, 500);
    tracing::info!("worker started, awaiting notifications");
    worker.run(&bus).await?;
    Ok(())
}
