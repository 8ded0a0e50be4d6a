//! # Database Persistence Layer
//!
//! Postgres persistence for consignment records via SQLx.
//!
//! The database is **optional**. When `DATABASE_URL` is set the node stores
//! records in the `consignments` table and row locks coordinate concurrent
//! runs, including runs in other processes. When absent the node falls back
//! to the in-memory store, which is only suitable for development.

pub mod consignments;

pub use consignments::PgConsignmentStore;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::DatabaseConfig;

/// Connect and apply the embedded migrations.
///
/// `None` selects the in-memory store.
pub async fn init_pool(config: Option<&DatabaseConfig>) -> Result<Option<PgPool>, sqlx::Error> {
    let Some(config) = config else {
        tracing::warn!("DATABASE_URL not set, consignments are kept in memory only");
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.url)
        .await?;
    tracing::info!(
        max_connections = config.max_connections,
        "connected to PostgreSQL"
    );

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("consignment schema up to date");

    Ok(Some(pool))
}
