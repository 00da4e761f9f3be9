use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use super::Trigger;
use crate::models::{Clock, Error, Job};
use crate::store::JobStore;

/// Entry point for deferring work.
///
/// Cheap to clone; handlers receive one so they can enqueue follow-up jobs.
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    trigger: Arc<dyn Trigger>,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, trigger: Arc<dyn Trigger>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            trigger,
            clock,
        }
    }

    /// Enqueue a job that is eligible immediately.
    pub async fn enqueue(&self, job_type: &str, payload: serde_json::Value) -> Result<i64, Error> {
        self.enqueue_in(job_type, payload, 0).await
    }

    /// Enqueue a job that becomes eligible after `delay_secs`; negative delays
    /// count as zero. The runner is woken right away either way. A delay past
    /// the representable time range is `InvalidParams("delay")`.
    pub async fn enqueue_in(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        delay_secs: i64,
    ) -> Result<i64, Error> {
        let available_at = Duration::try_seconds(delay_secs.max(0))
            .and_then(|delay| self.clock.now().checked_add_signed(delay))
            .ok_or(Error::InvalidParams("delay"))?;
        let job_id = self.store.insert(job_type, &payload, available_at).await?;
        debug!({ job_id, job_type, delay_secs }, "enqueued");
        self.trigger.run_now().await?;
        Ok(job_id)
    }

    pub async fn enqueue_json<P: Serialize>(
        &self,
        job_type: &str,
        payload: &P,
        delay_secs: i64,
    ) -> Result<i64, Error> {
        let payload = serde_json::to_value(payload)?;
        self.enqueue_in(job_type, payload, delay_secs).await
    }

    pub async fn get(&self, job_id: i64) -> Result<Option<Job>, Error> {
        self.store.get(job_id).await
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn trigger(&self) -> &Arc<dyn Trigger> {
        &self.trigger
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
use crate::models::{JobStatus, ManualClock};
#[cfg(test)]
use crate::services::trigger;
#[cfg(test)]
use crate::store::MemoryJobStore;
#[cfg(test)]
use serde_json::json;

#[cfg(test)]
fn queue() -> (JobQueue, MemoryJobStore, ManualClock, async_channel::Receiver<()>) {
    let clock = ManualClock::default();
    let store = MemoryJobStore::new(Arc::new(clock.clone()));
    let (trigger, rx) = trigger::channel();
    let queue = JobQueue::new(Arc::new(store.clone()), Arc::new(trigger), Arc::new(clock.clone()));
    (queue, store, clock, rx)
}

#[tokio::test]
async fn enqueue_inserts_pending_and_notifies() -> anyhow::Result<()> {
    // arrange
    let (queue, store, clock, rx) = queue();

    // act
    let job_id = queue.enqueue("send_email", json!({"to": "a@b.com"})).await?;

    // assert
    let job = store.get(job_id).await?.expect("job");
    assert_eq!("send_email", job.job_type);
    assert_eq!(JobStatus::Pending, job.status);
    assert_eq!(0, job.attempts);
    assert_eq!(clock.now(), job.available_at);
    assert_eq!(1, rx.len());
    Ok(())
}

#[tokio::test]
async fn enqueue_in_delays_eligibility() -> anyhow::Result<()> {
    // arrange
    let (queue, store, clock, rx) = queue();
    let enqueued_at = clock.now();

    // act
    let job_id = queue.enqueue_in("report", json!(null), 120).await?;
    clock.advance(Duration::seconds(119));
    let early = store.claim_batch(10).await?;
    clock.advance(Duration::seconds(1));
    let due = store.claim_batch(10).await?;

    // assert
    assert_eq!(1, rx.len());
    assert!(early.is_empty());
    assert_eq!(vec![job_id], due.iter().map(|job| job.id).collect::<Vec<_>>());
    assert_eq!(enqueued_at + Duration::seconds(120), due[0].available_at);
    Ok(())
}

#[tokio::test]
async fn enqueue_negative_delay_is_immediate() -> anyhow::Result<()> {
    // arrange
    let (queue, store, clock, _rx) = queue();

    // act
    let job_id = queue.enqueue_in("report", json!(null), -30).await?;

    // assert
    let job = store.get(job_id).await?.expect("job");
    assert_eq!(clock.now(), job.available_at);
    assert!(store.has_eligible_pending().await?);
    Ok(())
}

#[tokio::test]
async fn enqueue_out_of_range_delay_is_rejected() -> anyhow::Result<()> {
    // arrange
    let (queue, store, _clock, rx) = queue();

    // act
    let max = queue.enqueue_in("report", json!(null), i64::MAX).await;
    let huge = queue.enqueue_in("report", json!(null), 10_000_000_000_000).await;

    // assert
    assert!(matches!(max, Err(Error::InvalidParams("delay"))));
    assert!(matches!(huge, Err(Error::InvalidParams("delay"))));
    assert!(store.all().await.is_empty());
    assert!(rx.is_empty());
    Ok(())
}

#[tokio::test]
async fn enqueue_json_serializes_payload() -> anyhow::Result<()> {
    // arrange
    #[derive(Serialize)]
    struct Email<'a> {
        to: &'a str,
    }
    let (queue, store, _clock, _rx) = queue();

    // act
    let job_id = queue.enqueue_json("send_email", &Email { to: "a@b.com" }, 0).await?;

    // assert
    let job = store.get(job_id).await?.expect("job");
    assert_eq!(json!({"to": "a@b.com"}), job.payload);
    Ok(())
}
