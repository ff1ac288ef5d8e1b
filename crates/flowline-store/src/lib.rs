//! Postgres-backed durable storage: the Event Log (A), the Command Store
//! (B), and the Transient Variable Store (I).

pub mod command_store;
pub mod error;
pub mod event_log;
pub mod vars;

pub use command_store::{CommandStore, PgCommandStore};
pub use error::{StoreError, StoreResult};
pub use event_log::{EventFilter, EventLog, PgEventLog};
pub use vars::{PgTransientVarStore, TransientVar, TransientVarStore, VarKind};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn create_pool(database_url: &str) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
