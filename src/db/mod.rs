use crate::models::Error;
use sqlx::{Pool, Postgres};

pub use jobqueue::PgJobStore;
pub use locks::PgLock;

mod jobqueue;
mod locks;

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS jobs (
        id BIGSERIAL PRIMARY KEY,
        type VARCHAR(100) NOT NULL,
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        payload JSONB NOT NULL DEFAULT 'null'::jsonb,
        attempts INT NOT NULL DEFAULT 0,
        last_error TEXT NULL,
        available_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS jobs_type_idx ON jobs (type)",
    "CREATE INDEX IF NOT EXISTS jobs_status_available_at_idx ON jobs (status, available_at)",
    "CREATE TABLE IF NOT EXISTS job_locks (
        key TEXT PRIMARY KEY,
        expires_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS jobs_status_updated_at_idx ON jobs (status, updated_at)",
];

/// Create the queue tables and indexes if they do not exist yet.
pub async fn create_schema(pool: &Pool<Postgres>) -> Result<(), Error> {
    for sql in SCHEMA {
        sqlx::query(sql).execute(pool).await?;
    }
    Ok(())
}

pub async fn select_one(pool: &Pool<Postgres>) -> Result<(), Error> {
    _ = sqlx::query("SELECT 1").fetch_one(pool).await?;
    Ok(())
}
