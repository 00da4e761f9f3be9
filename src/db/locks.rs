use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use std::{sync::Arc, time::Duration};

use crate::lock::Lock;
use crate::models::{Clock, Error};

/// [`Lock`] backed by the `job_locks` table.
///
/// Acquire is a single upsert that only overwrites an expired marker, so two
/// runners can never both observe success for the same key.
#[derive(Debug, Clone)]
pub struct PgLock {
    pool: Pool<Postgres>,
    clock: Arc<dyn Clock>,
}

impl PgLock {
    pub fn new(pool: Pool<Postgres>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl Lock for PgLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        const SQL: &str = "
        INSERT INTO job_locks(key, expires_at) VALUES ($1, $3)
        ON CONFLICT (key) DO UPDATE SET expires_at = EXCLUDED.expires_at
        WHERE job_locks.expires_at <= $2
        RETURNING key";
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| Error::InvalidParams("lock_ttl"))?;
        let row = sqlx::query_scalar::<_, String>(SQL)
            .bind(key)
            .bind(now)
            .bind(now + ttl)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn release(&self, key: &str) -> Result<(), Error> {
        const SQL: &str = "DELETE FROM job_locks WHERE key = $1";
        sqlx::query(SQL).bind(key).execute(&self.pool).await?;
        Ok(())
    }
}
