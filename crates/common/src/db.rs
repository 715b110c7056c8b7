//! Postgres pool setup and schema bootstrap.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

const SCHEMA_SQL: &str = include_str!("../migrations/0001_schema.sql");

/// Opens a pooled Postgres connection.
pub async fn connect(db_uri: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(db_uri)
        .await
}

/// Applies the base schema (idempotent).
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

/// Verifies connectivity with a trivial query.
pub async fn health_check(pool: &PgPool) -> bool {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .is_ok()
}
