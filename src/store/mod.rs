//! Durable storage of job rows.
//!
//! - [`JobStore`]: the storage contract the runner and the enqueue API are
//!   written against.
//! - [`MemoryJobStore`]: in-process store for development and tests.
//! - [`PgJobStore`](crate::db::PgJobStore): Postgres table store.
//!
//! Every status change is scoped to rows still in the expected prior status,
//! so two actors racing on the same row cannot both win. Mutations report the
//! number of rows they touched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Error, Job};

pub use memory::MemoryJobStore;

mod memory;

#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Insert a new `pending` row with zero attempts and return its id.
    async fn insert(
        &self,
        job_type: &str,
        payload: &serde_json::Value,
        available_at: DateTime<Utc>,
    ) -> Result<i64, Error>;

    async fn get(&self, job_id: i64) -> Result<Option<Job>, Error>;

    /// Atomically move up to `limit` eligible `pending` rows (oldest id first)
    /// to `processing` and return them in ascending id order.
    async fn claim_batch(&self, limit: i64) -> Result<Vec<Job>, Error>;

    async fn finalize_success(&self, job_id: i64) -> Result<u64, Error>;

    /// Back to `pending` with a new attempt count, eligibility time and error.
    async fn finalize_retry(
        &self,
        job_id: i64,
        attempts: i32,
        next_available_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<u64, Error>;

    async fn finalize_permanent_failure(
        &self,
        job_id: i64,
        attempts: i32,
        last_error: &str,
    ) -> Result<u64, Error>;

    /// Set `last_error` without touching the status.
    async fn record_error(&self, job_id: i64, message: &str) -> Result<u64, Error>;

    /// Return claimed rows that were never processed to `pending`.
    async fn release(&self, job_ids: &[i64]) -> Result<u64, Error>;

    /// Return rows stuck in `processing` since before `older_than` to `pending`.
    async fn requeue_stale(&self, older_than: DateTime<Utc>) -> Result<u64, Error>;

    async fn has_eligible_pending(&self) -> Result<bool, Error>;

    /// Earliest `available_at` among `pending` rows.
    async fn next_pending_at(&self) -> Result<Option<DateTime<Utc>>, Error>;
}
