//! PostgreSQL-backed stores.
//!
//! Every store goes through the SQL circuit breaker; schema lives in the
//! `migrations/` directory and is applied at startup. In-memory
//! counterparts for each store live next to their traits and serve tests
//! and database-less embedded runs.

pub mod event_log;
pub mod schedules;
pub mod users;

pub use event_log::PgEventLogStore;
pub use schedules::PgScheduleCatalog;
pub use users::{MemoryUserStore, PgUserStore, UserRecord, UserStore, UserStoreError};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connect to PostgreSQL and apply pending migrations.
pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}
