//! Database wiring: pool creation and schema setup.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

const SCHEMA: &str = include_str!("../migrations/0001_router.sql");

/// Connect and apply the schema. Any failure here is fatal to startup.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    sqlx::raw_sql(SCHEMA).execute(&pool).await?;
    info!("database schema ready");
    Ok(pool)
}
