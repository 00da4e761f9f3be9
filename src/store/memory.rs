use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::JobStore;
use crate::models::{truncate_error, Clock, Error, Job, JobStatus, SystemClock};

/// In-memory [`JobStore`] for development and testing.
///
/// Rows live in a `Vec` ordered by id behind a mutex; every operation runs
/// inside one critical section, which makes the claim atomic. Not durable.
#[derive(Debug, Clone)]
pub struct MemoryJobStore {
    inner: Arc<Mutex<Rows>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct Rows {
    last_id: i64,
    jobs: Vec<Job>,
}

impl Rows {
    fn find_mut(&mut self, job_id: i64, status: JobStatus) -> Option<&mut Job> {
        self.jobs
            .iter_mut()
            .find(|job| job.id == job_id && job.status == status)
    }
}

impl MemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Rows::default())),
            clock,
        }
    }

    /// Snapshot of every row, in id order.
    pub async fn all(&self) -> Vec<Job> {
        self.inner.lock().await.jobs.clone()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(
        &self,
        job_type: &str,
        payload: &serde_json::Value,
        available_at: DateTime<Utc>,
    ) -> Result<i64, Error> {
        let now = self.clock.now();
        let mut rows = self.inner.lock().await;
        rows.last_id += 1;
        let id = rows.last_id;
        rows.jobs.push(Job {
            id,
            job_type: job_type.to_owned(),
            status: JobStatus::Pending,
            payload: payload.clone(),
            attempts: 0,
            last_error: None,
            available_at,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn get(&self, job_id: i64) -> Result<Option<Job>, Error> {
        let rows = self.inner.lock().await;
        Ok(rows.jobs.iter().find(|job| job.id == job_id).cloned())
    }

    async fn claim_batch(&self, limit: i64) -> Result<Vec<Job>, Error> {
        let now = self.clock.now();
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut rows = self.inner.lock().await;
        let claimed: Vec<Job> = rows
            .jobs
            .iter_mut()
            .filter(|job| job.status == JobStatus::Pending && job.available_at <= now)
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Processing;
                job.updated_at = now;
                job.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn finalize_success(&self, job_id: i64) -> Result<u64, Error> {
        let now = self.clock.now();
        let mut rows = self.inner.lock().await;
        let Some(job) = rows.find_mut(job_id, JobStatus::Processing) else {
            return Ok(0);
        };
        job.status = JobStatus::Done;
        job.updated_at = now;
        Ok(1)
    }

    async fn finalize_retry(
        &self,
        job_id: i64,
        attempts: i32,
        next_available_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<u64, Error> {
        let now = self.clock.now();
        let mut rows = self.inner.lock().await;
        let Some(job) = rows.find_mut(job_id, JobStatus::Processing) else {
            return Ok(0);
        };
        job.status = JobStatus::Pending;
        job.attempts = attempts;
        job.available_at = next_available_at;
        job.last_error = Some(truncate_error(last_error));
        job.updated_at = now;
        Ok(1)
    }

    async fn finalize_permanent_failure(
        &self,
        job_id: i64,
        attempts: i32,
        last_error: &str,
    ) -> Result<u64, Error> {
        let now = self.clock.now();
        let mut rows = self.inner.lock().await;
        let Some(job) = rows.find_mut(job_id, JobStatus::Processing) else {
            return Ok(0);
        };
        job.status = JobStatus::Failed;
        job.attempts = attempts;
        job.last_error = Some(truncate_error(last_error));
        job.updated_at = now;
        Ok(1)
    }

    async fn record_error(&self, job_id: i64, message: &str) -> Result<u64, Error> {
        let now = self.clock.now();
        let mut rows = self.inner.lock().await;
        let Some(job) = rows.jobs.iter_mut().find(|job| job.id == job_id) else {
            return Ok(0);
        };
        job.last_error = Some(truncate_error(message));
        job.updated_at = now;
        Ok(1)
    }

    async fn release(&self, job_ids: &[i64]) -> Result<u64, Error> {
        let now = self.clock.now();
        let mut rows = self.inner.lock().await;
        let mut released = 0;
        for job in rows
            .jobs
            .iter_mut()
            .filter(|job| job.status == JobStatus::Processing && job_ids.contains(&job.id))
        {
            job.status = JobStatus::Pending;
            job.updated_at = now;
            released += 1;
        }
        Ok(released)
    }

    async fn requeue_stale(&self, older_than: DateTime<Utc>) -> Result<u64, Error> {
        let now = self.clock.now();
        let mut rows = self.inner.lock().await;
        let mut requeued = 0;
        for job in rows
            .jobs
            .iter_mut()
            .filter(|job| job.status == JobStatus::Processing && job.updated_at < older_than)
        {
            job.status = JobStatus::Pending;
            job.updated_at = now;
            requeued += 1;
        }
        Ok(requeued)
    }

    async fn has_eligible_pending(&self) -> Result<bool, Error> {
        let now = self.clock.now();
        let rows = self.inner.lock().await;
        Ok(rows
            .jobs
            .iter()
            .any(|job| job.status == JobStatus::Pending && job.available_at <= now))
    }

    async fn next_pending_at(&self) -> Result<Option<DateTime<Utc>>, Error> {
        let rows = self.inner.lock().await;
        Ok(rows
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Pending)
            .map(|job| job.available_at)
            .min())
    }
}

#[cfg(test)]
use crate::models::ManualClock;
#[cfg(test)]
use chrono::Duration;
#[cfg(test)]
use serde_json::json;

#[cfg(test)]
fn store() -> (MemoryJobStore, ManualClock) {
    let clock = ManualClock::default();
    (MemoryJobStore::new(Arc::new(clock.clone())), clock)
}

#[tokio::test]
async fn insert_assigns_pending_and_increasing_ids() -> anyhow::Result<()> {
    // arrange
    let (store, clock) = store();

    // act
    let first = store.insert("a", &json!({"n": 1}), clock.now()).await?;
    let second = store.insert("b", &json!({"n": 2}), clock.now()).await?;

    // assert
    assert!(second > first);
    let job = store.get(first).await?.expect("job");
    assert_eq!(JobStatus::Pending, job.status);
    assert_eq!(0, job.attempts);
    assert_eq!(json!({"n": 1}), job.payload);
    assert_eq!(None, job.last_error);
    Ok(())
}

#[tokio::test]
async fn claim_batch_respects_limit_and_order() -> anyhow::Result<()> {
    // arrange
    let (store, clock) = store();
    for n in 0..5 {
        store.insert("a", &json!(n), clock.now()).await?;
    }

    // act
    let first = store.claim_batch(3).await?;
    let second = store.claim_batch(3).await?;
    let third = store.claim_batch(3).await?;

    // assert
    let ids: Vec<i64> = first.iter().map(|job| job.id).collect();
    assert_eq!(vec![1, 2, 3], ids);
    assert!(first.iter().all(|job| job.status == JobStatus::Processing));
    assert_eq!(2, second.len());
    assert!(third.is_empty());
    Ok(())
}

#[tokio::test]
async fn claim_batch_skips_future_rows() -> anyhow::Result<()> {
    // arrange
    let (store, clock) = store();
    let later = store
        .insert("a", &json!(null), clock.now() + Duration::seconds(30))
        .await?;

    // act
    let before = store.claim_batch(10).await?;
    clock.advance(Duration::seconds(30));
    let after = store.claim_batch(10).await?;

    // assert
    assert!(before.is_empty());
    assert_eq!(vec![later], after.iter().map(|job| job.id).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn claim_batch_never_returns_claimed_rows() -> anyhow::Result<()> {
    // arrange
    let (store, clock) = store();
    for n in 0..4 {
        store.insert("a", &json!(n), clock.now()).await?;
    }

    // act
    let (left, right) = tokio::join!(store.claim_batch(4), store.claim_batch(4));

    // assert
    let mut ids: Vec<i64> = left?.into_iter().chain(right?).map(|job| job.id).collect();
    ids.sort_unstable();
    assert_eq!(vec![1, 2, 3, 4], ids);
    Ok(())
}

#[tokio::test]
async fn finalize_is_scoped_to_processing() -> anyhow::Result<()> {
    // arrange
    let (store, clock) = store();
    let id = store.insert("a", &json!(null), clock.now()).await?;

    // act
    let early = store.finalize_success(id).await?;
    store.claim_batch(1).await?;
    let done = store.finalize_success(id).await?;
    let again = store.finalize_permanent_failure(id, 1, "late").await?;

    // assert
    assert_eq!(0, early);
    assert_eq!(1, done);
    assert_eq!(0, again);
    let job = store.get(id).await?.expect("job");
    assert_eq!(JobStatus::Done, job.status);
    assert_eq!(None, job.last_error);
    Ok(())
}

#[tokio::test]
async fn finalize_retry_writes_error_with_transition() -> anyhow::Result<()> {
    // arrange
    let (store, clock) = store();
    let id = store.insert("a", &json!(null), clock.now()).await?;
    store.claim_batch(1).await?;
    let next_at = clock.now() + Duration::seconds(60);

    // act
    store.finalize_retry(id, 1, next_at, "boom").await?;

    // assert
    let job = store.get(id).await?.expect("job");
    assert_eq!(JobStatus::Pending, job.status);
    assert_eq!(1, job.attempts);
    assert_eq!(next_at, job.available_at);
    assert_eq!(Some("boom".to_owned()), job.last_error);
    assert!(!store.has_eligible_pending().await?);
    assert_eq!(Some(next_at), store.next_pending_at().await?);
    Ok(())
}

#[tokio::test]
async fn record_error_keeps_status() -> anyhow::Result<()> {
    // arrange
    let (store, clock) = store();
    let id = store.insert("a", &json!(null), clock.now()).await?;

    // act
    let touched = store.record_error(id, "x".repeat(20_000).as_str()).await?;
    let missing = store.record_error(id + 1, "nope").await?;

    // assert
    assert_eq!(1, touched);
    assert_eq!(0, missing);
    let job = store.get(id).await?.expect("job");
    assert_eq!(JobStatus::Pending, job.status);
    assert_eq!(Some(10_000), job.last_error.map(|e| e.len()));
    Ok(())
}

#[tokio::test]
async fn release_and_requeue_stale() -> anyhow::Result<()> {
    // arrange
    let (store, clock) = store();
    for n in 0..3 {
        store.insert("a", &json!(n), clock.now()).await?;
    }
    store.claim_batch(3).await?;

    // act
    let released = store.release(&[1]).await?;
    clock.advance(Duration::seconds(120));
    let fresh = store.requeue_stale(clock.now() - Duration::seconds(600)).await?;
    let stale = store.requeue_stale(clock.now() - Duration::seconds(60)).await?;

    // assert
    assert_eq!(1, released);
    assert_eq!(0, fresh);
    assert_eq!(2, stale);
    assert!(store
        .all()
        .await
        .iter()
        .all(|job| job.status == JobStatus::Pending && job.attempts == 0));
    Ok(())
}
