//! Flowline coordinator HTTP server: the only way in for execution
//! starts, worker-reported events, and transient-variable access.

use std::sync::Arc;

use flowline_api::playbook_source::FsPlaybookSource;
use flowline_api::{routes, AppState};
use flowline_bus::{BusConfig, NatsNotificationBus};
use flowline_engine::Engine;
use flowline_render::EngineConfig;
use flowline_store::{create_pool, run_migrations, PgCommandStore, PgEventLog, PgTransientVarStore};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_env()?;
    let worker_id: i64 = std::env::var("FLOWLINE_NODE_ID").ok().and_then(|v| v.parse().ok()).unwrap_or(0);
    let playbook_dir = std::env::var("FLOWLINE_PLAYBOOK_DIR").unwrap_or_else(|_| "./playbooks".to_string());
    let server_url = std::env::var("FLOWLINE_SERVER_URL").unwrap_or_else(|_| format!("http://{}", config.http_bind_addr));

    info!("connecting to database");
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;

    let events: Arc<dyn flowline_store::EventLog> = Arc::new(PgEventLog::new(pool.clone(), worker_id));
    let commands: Arc<dyn flowline_store::CommandStore> = Arc::new(PgCommandStore::new(pool.clone()));
    let vars: Arc<dyn flowline_store::TransientVarStore> = Arc::new(PgTransientVarStore::new(pool.clone()));
    let playbooks = Arc::new(FsPlaybookSource::new(playbook_dir));

    info!(bus_url = %config.bus_url, "connecting to notification bus");
    let bus = NatsNotificationBus::connect(
        &config.bus_url,
        BusConfig {
            subject: config.bus_subject.clone(),
            consumer_name: config.bus_consumer.clone(),
            max_in_flight: config.bus_max_in_flight,
            ..Default::default()
        },
    )
    .await?;
    let loop_kv: Arc<dyn flowline_bus::LoopKv> =
        match flowline_bus::NatsLoopKv::connect(&config.bus_url, "flowline-loop-kv").await {
            Ok(kv) => Arc::new(kv),
            Err(e) => {
                tracing::warn!(error = %e, "loop KV bucket unreachable, falling back to in-process (single-coordinator only)");
                Arc::new(flowline_bus::LocalLoopKv::new())
            }
        };

    let engine = Arc::new(Engine::new(
        events.clone(),
        commands,
        loop_kv,
        Arc::new(bus),
        playbooks,
        vars.clone(),
        &config,
        worker_id,
        server_url,
    ));

    let state = AppState::new(engine, events, vars);

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!(addr = %config.http_bind_addr, "starting server");
    let listener = TcpListener::bind(config.http_bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
