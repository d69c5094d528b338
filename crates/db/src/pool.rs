//! Postgres pool behind [`PgDocumentStore`](crate::PgDocumentStore).

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// Pool shared by every collection of the document store.
pub type DbPool = PgPool;

/// Connect to `database_url` with at most `max_connections` connections.
///
/// The CLI keeps this small for one-shot commands such as `migrate`.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    info!(max_connections, "connecting to document store");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Create or upgrade the `documents` table from the workspace `migrations/`
/// directory, embedded at build time.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("applying document store migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
