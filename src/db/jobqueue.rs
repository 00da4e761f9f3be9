use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, Pool, Postgres};
use std::sync::Arc;

use crate::models::{truncate_error, Clock, Error, Job, JobRow};
use crate::store::JobStore;

/// [`JobStore`] over the `jobs` table.
///
/// `now` is bound from the injected [`Clock`] rather than taken from the
/// database, so eligibility checks and backoff timestamps share one clock.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
    clock: Arc<dyn Clock>,
}

impl PgJobStore {
    pub fn new(pool: Pool<Postgres>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(
        &self,
        job_type: &str,
        payload: &serde_json::Value,
        available_at: DateTime<Utc>,
    ) -> Result<i64, Error> {
        const SQL: &str = "
        INSERT INTO jobs(type, status, payload, attempts, available_at, created_at, updated_at)
        VALUES ($1, 'pending', $2, 0, $3, $4, $4) RETURNING id";
        let job_id = sqlx::query_scalar::<_, i64>(SQL)
            .bind(job_type)
            .bind(Json(payload))
            .bind(available_at)
            .bind(self.clock.now())
            .fetch_one(&self.pool)
            .await?;
        Ok(job_id)
    }

    async fn get(&self, job_id: i64) -> Result<Option<Job>, Error> {
        const SQL: &str = "SELECT * FROM jobs WHERE id = $1";
        let row = sqlx::query_as::<_, JobRow>(SQL)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn claim_batch(&self, limit: i64) -> Result<Vec<Job>, Error> {
        const SQL: &str = "WITH a AS (
            SELECT id FROM jobs WHERE status = 'pending' AND available_at <= $2 ORDER BY id LIMIT $1 FOR UPDATE SKIP LOCKED
        )
        UPDATE jobs SET status = 'processing', updated_at = $2
        FROM a WHERE jobs.id = a.id AND jobs.status = 'pending'
        RETURNING jobs.*";
        let rows = sqlx::query_as::<_, JobRow>(SQL)
            .bind(limit)
            .bind(self.clock.now())
            .fetch_all(&self.pool)
            .await?;
        let mut jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        // UPDATE ... RETURNING has no defined order
        jobs.sort_unstable_by_key(|job| job.id);
        Ok(jobs)
    }

    async fn finalize_success(&self, job_id: i64) -> Result<u64, Error> {
        const SQL: &str = "UPDATE jobs SET status = 'done', updated_at = $2 WHERE id = $1 AND status = 'processing'";
        let res = sqlx::query(SQL)
            .bind(job_id)
            .bind(self.clock.now())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn finalize_retry(
        &self,
        job_id: i64,
        attempts: i32,
        next_available_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<u64, Error> {
        const SQL: &str = "UPDATE jobs
        SET status = 'pending', attempts = $2, available_at = $3, last_error = $4, updated_at = $5
        WHERE id = $1 AND status = 'processing'";
        let res = sqlx::query(SQL)
            .bind(job_id)
            .bind(attempts)
            .bind(next_available_at)
            .bind(truncate_error(last_error))
            .bind(self.clock.now())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn finalize_permanent_failure(
        &self,
        job_id: i64,
        attempts: i32,
        last_error: &str,
    ) -> Result<u64, Error> {
        const SQL: &str = "UPDATE jobs
        SET status = 'failed', attempts = $2, last_error = $3, updated_at = $4
        WHERE id = $1 AND status = 'processing'";
        let res = sqlx::query(SQL)
            .bind(job_id)
            .bind(attempts)
            .bind(truncate_error(last_error))
            .bind(self.clock.now())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn record_error(&self, job_id: i64, message: &str) -> Result<u64, Error> {
        const SQL: &str = "UPDATE jobs SET last_error = $2, updated_at = $3 WHERE id = $1";
        let res = sqlx::query(SQL)
            .bind(job_id)
            .bind(truncate_error(message))
            .bind(self.clock.now())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn release(&self, job_ids: &[i64]) -> Result<u64, Error> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        const SQL: &str = "UPDATE jobs SET status = 'pending', updated_at = $2 WHERE id = ANY($1) AND status = 'processing'";
        let res = sqlx::query(SQL)
            .bind(job_ids)
            .bind(self.clock.now())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn requeue_stale(&self, older_than: DateTime<Utc>) -> Result<u64, Error> {
        const SQL: &str = "WITH a AS (
            SELECT id FROM jobs WHERE status = 'processing' AND updated_at < $1 ORDER BY id FOR UPDATE SKIP LOCKED
        )
        UPDATE jobs SET status = 'pending', updated_at = $2
        FROM a WHERE jobs.id = a.id AND jobs.status = 'processing'";
        let res = sqlx::query(SQL)
            .bind(older_than)
            .bind(self.clock.now())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn has_eligible_pending(&self) -> Result<bool, Error> {
        const SQL: &str = "SELECT EXISTS (SELECT 1 FROM jobs WHERE status = 'pending' AND available_at <= $1)";
        let exists = sqlx::query_scalar::<_, bool>(SQL)
            .bind(self.clock.now())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn next_pending_at(&self) -> Result<Option<DateTime<Utc>>, Error> {
        const SQL: &str = "SELECT min(available_at) FROM jobs WHERE status = 'pending'";
        let next_at = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(SQL)
            .fetch_one(&self.pool)
            .await?;
        Ok(next_at)
    }
}
