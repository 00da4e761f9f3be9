use futures::FutureExt;
use serde::Serialize;
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};
use tracing::Instrument;
#[allow(unused_imports)]
use tracing::{debug, error, info, info_span, warn};

use super::JobQueue;
use crate::{
    lock::Lock,
    models::{Error, Job, QueueOptions},
    registry::HandlerRegistry,
};

/// Result of a single [`BatchRunner::run`] invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another run holds the lock; nothing was touched.
    Locked,
    Completed(RunReport),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub batches: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub released: u64,
    pub requeued_stale: u64,
    pub timed_out: bool,
}

/// Drains eligible jobs in batches under a lock, inside a time box.
#[derive(Debug)]
pub struct BatchRunner {
    queue: JobQueue,
    lock: Arc<dyn Lock>,
    registry: HandlerRegistry,
    options: QueueOptions,
}

impl BatchRunner {
    pub fn new(
        queue: JobQueue,
        lock: Arc<dyn Lock>,
        registry: HandlerRegistry,
        options: QueueOptions,
    ) -> Self {
        Self {
            queue,
            lock,
            registry,
            options,
        }
    }

    pub async fn run(&self) -> Result<RunOutcome, Error> {
        let lock_key = &self.options.lock_key;
        if !self.lock.acquire(lock_key, self.options.lock_ttl).await? {
            debug!({ lock_key }, "run skipped, lock held");
            return Ok(RunOutcome::Locked);
        }
        let drained = self.drain().await;
        let released = self.lock.release(lock_key).await;
        let report = drained?;
        released?;
        self.rearm().await?;
        debug!({ lock_key }, "run completed {:?}", report);
        Ok(RunOutcome::Completed(report))
    }

    async fn drain(&self) -> Result<RunReport, Error> {
        let store = self.queue.store();
        let clock = self.queue.clock();
        let mut report = RunReport::default();

        let stale_after = chrono::Duration::from_std(self.options.stale_after)
            .map_err(|_| Error::InvalidParams("stale_after"))?;
        let older_than = clock
            .now()
            .checked_sub_signed(stale_after)
            .ok_or(Error::InvalidParams("stale_after"))?;
        report.requeued_stale = store.requeue_stale(older_than).await?;
        if report.requeued_stale > 0 {
            warn!({ requeued = report.requeued_stale }, "requeued stale claims");
        }

        let run_timeout = chrono::Duration::from_std(self.options.run_timeout)
            .map_err(|_| Error::InvalidParams("run_timeout"))?;
        let started_at = clock.now();
        'batches: loop {
            let jobs = store.claim_batch(self.options.batch_size).await?;
            if jobs.is_empty() {
                break;
            }
            report.batches += 1;
            report.claimed += jobs.len() as u64;
            let mut jobs = jobs.into_iter();
            while let Some(job) = jobs.next() {
                if let Err(err) = self.process(job, &mut report).await {
                    let rest: Vec<i64> = jobs.map(|job| job.id).collect();
                    if let Err(release_err) = store.release(&rest).await {
                        error!({ unreleased = rest.len() }, "release after failure {}", release_err);
                    }
                    return Err(err);
                }
                if clock.now() - started_at >= run_timeout {
                    let rest: Vec<i64> = jobs.map(|job| job.id).collect();
                    report.released = store.release(&rest).await?;
                    report.timed_out = true;
                    info!({ released = report.released }, "run timed out");
                    break 'batches;
                }
            }
        }
        Ok(report)
    }

    async fn process(&self, job: Job, report: &mut RunReport) -> Result<(), Error> {
        let span = info_span!("job", job_id = job.id, job_type = %job.job_type);
        async move {
            let store = self.queue.store();
            let job_id = job.id;
            let attempts = job.attempts;
            match self.dispatch(job).await {
                Ok(()) => {
                    if store.finalize_success(job_id).await? == 0 {
                        warn!("job no longer processing, success dropped");
                    }
                    report.succeeded += 1;
                    debug!("done");
                }
                Err(message) => {
                    let attempts = attempts + 1;
                    if self.options.retry_enabled && attempts < self.options.max_attempts {
                        let delay = self
                            .options
                            .backoff
                            .delay_for(u32::try_from(attempts).unwrap_or(u32::MAX));
                        let next_at = self.queue.clock().now() + chrono::Duration::seconds(delay.into());
                        store.finalize_retry(job_id, attempts, next_at, &message).await?;
                        report.retried += 1;
                        info!({ attempts, delay }, "retry scheduled: {}", message);
                    } else {
                        store.finalize_permanent_failure(job_id, attempts, &message).await?;
                        report.failed += 1;
                        warn!({ attempts }, "failed permanently: {}", message);
                    }
                }
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Runs the handler for `job`; any failure comes back as its message.
    async fn dispatch(&self, job: Job) -> Result<(), String> {
        let Some(handler) = self.registry.resolve(&job.job_type) else {
            return Err(format!("no handler for type '{}'", job.job_type));
        };
        let payload = job.payload.clone();
        let queue = self.queue.clone();
        let invoked = AssertUnwindSafe(async move { handler(payload, job, queue).await })
            .catch_unwind()
            .await;
        match invoked {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err("handler returned false".to_owned()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    async fn rearm(&self) -> Result<(), Error> {
        let store = self.queue.store();
        let trigger = self.queue.trigger();
        if store.has_eligible_pending().await? {
            return trigger.run_now().await;
        }
        if let Some(next_at) = store.next_pending_at().await? {
            let delay = (next_at - self.queue.clock().now())
                .to_std()
                .unwrap_or_default();
            trigger.run_after(delay).await?;
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
use crate::lock::MemoryLock;
#[cfg(test)]
use crate::models::{Backoff, JobStatus, ManualClock};
#[cfg(test)]
use crate::registry::BoxError;
#[cfg(test)]
use crate::services::trigger;
#[cfg(test)]
use crate::store::{JobStore, MemoryJobStore};
#[cfg(test)]
use async_channel::Receiver;
#[cfg(test)]
use chrono::Duration;
#[cfg(test)]
use serde_json::json;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(test)]
use crate::models::Clock;
#[cfg(test)]
use tokio::sync::Notify;

#[cfg(test)]
struct Fixture {
    runner: Arc<BatchRunner>,
    queue: JobQueue,
    store: MemoryJobStore,
    lock: MemoryLock,
    clock: ManualClock,
    rx: Receiver<()>,
}

#[cfg(test)]
fn fixture(clock: ManualClock, registry: HandlerRegistry, options: QueueOptions) -> Fixture {
    let store = MemoryJobStore::new(Arc::new(clock.clone()));
    let lock = MemoryLock::new(Arc::new(clock.clone()));
    let (trigger, rx) = trigger::channel();
    let queue = JobQueue::new(Arc::new(store.clone()), Arc::new(trigger), Arc::new(clock.clone()));
    let runner = BatchRunner::new(queue.clone(), Arc::new(lock.clone()), registry, options);
    Fixture {
        runner: Arc::new(runner),
        queue,
        store,
        lock,
        clock,
        rx,
    }
}

#[cfg(test)]
fn succeeding(job_type: &str) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(job_type, |_, _, _| async { Ok(true) });
    registry
}

#[cfg(test)]
fn completed(outcome: RunOutcome) -> RunReport {
    match outcome {
        RunOutcome::Completed(report) => report,
        RunOutcome::Locked => panic!("run was locked"),
    }
}

#[cfg(test)]
async fn job(store: &MemoryJobStore, job_id: i64) -> anyhow::Result<Job> {
    store
        .get(job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {job_id} missing"))
}

#[tokio::test]
async fn run_single_job_done() -> anyhow::Result<()> {
    // arrange
    let fx = fixture(ManualClock::default(), succeeding("send_email"), QueueOptions::default());
    let job_id = fx.queue.enqueue("send_email", json!({"to": "a@b.com"})).await?;
    fx.rx.try_recv()?;

    // act
    let report = completed(fx.runner.run().await?);

    // assert
    let job = job(&fx.store, job_id).await?;
    assert_eq!(JobStatus::Done, job.status);
    assert_eq!(0, job.attempts);
    assert_eq!(1, report.batches);
    assert_eq!(1, report.succeeded);
    assert!(fx.rx.is_empty());
    Ok(())
}

#[tokio::test]
async fn run_drains_multiple_batches() -> anyhow::Result<()> {
    // arrange
    let fx = fixture(ManualClock::default(), succeeding("noop"), QueueOptions::default());
    for _ in 0..30 {
        fx.queue.enqueue("noop", json!(null)).await?;
    }

    // act
    let report = completed(fx.runner.run().await?);

    // assert
    assert_eq!(2, report.batches);
    assert_eq!(30, report.claimed);
    assert_eq!(30, report.succeeded);
    assert!(fx.store.all().await.iter().all(|job| job.status == JobStatus::Done));
    Ok(())
}

#[tokio::test]
async fn run_retries_with_backoff_then_succeeds() -> anyhow::Result<()> {
    // arrange
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register("flaky", {
        let calls = Arc::clone(&calls);
        move |_, _, _| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(call >= 2) }
        }
    });
    let options = QueueOptions::default();
    let backoff = options.backoff.clone();
    let fx = fixture(ManualClock::default(), registry, options);
    let job_id = fx.queue.enqueue("flaky", json!(null)).await?;

    // act & assert
    let t1 = fx.clock.now();
    let first = completed(fx.runner.run().await?);
    let job1 = job(&fx.store, job_id).await?;
    assert_eq!(1, first.retried);
    assert_eq!(JobStatus::Pending, job1.status);
    assert_eq!(1, job1.attempts);
    assert_eq!(Some("handler returned false"), job1.last_error.as_deref());
    assert_eq!(t1 + Duration::seconds(backoff.delay_for(1).into()), job1.available_at);

    fx.clock.advance(Duration::seconds(30));
    let early = completed(fx.runner.run().await?);
    assert_eq!(0, early.claimed);

    fx.clock.set(job1.available_at);
    let t2 = fx.clock.now();
    completed(fx.runner.run().await?);
    let job2 = job(&fx.store, job_id).await?;
    assert_eq!(2, job2.attempts);
    assert_eq!(t2 + Duration::seconds(backoff.delay_for(2).into()), job2.available_at);

    fx.clock.set(job2.available_at);
    let last = completed(fx.runner.run().await?);
    let job3 = job(&fx.store, job_id).await?;
    assert_eq!(1, last.succeeded);
    assert_eq!(JobStatus::Done, job3.status);
    assert_eq!(2, job3.attempts);
    assert_eq!(3, calls.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn run_exhausts_attempts() -> anyhow::Result<()> {
    // arrange
    let mut registry = HandlerRegistry::new();
    registry.register("broken", |_, _, _| async { Err(BoxError::from("boom")) });
    let options = QueueOptions {
        max_attempts: 3,
        backoff: Backoff::new(vec![10, 20])?,
        ..QueueOptions::default()
    };
    let fx = fixture(ManualClock::default(), registry, options);
    let job_id = fx.queue.enqueue("broken", json!(null)).await?;

    // act
    let mut reports = Vec::new();
    for _ in 0..4 {
        reports.push(completed(fx.runner.run().await?));
        fx.clock.advance(Duration::hours(1));
    }

    // assert
    let job = job(&fx.store, job_id).await?;
    assert_eq!(JobStatus::Failed, job.status);
    assert_eq!(3, job.attempts);
    assert_eq!(Some("boom"), job.last_error.as_deref());
    assert_eq!(vec![1, 1, 0, 0], reports.iter().map(|r| r.retried).collect::<Vec<_>>());
    assert_eq!(vec![0, 0, 1, 0], reports.iter().map(|r| r.failed).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn run_without_retry_fails_at_once() -> anyhow::Result<()> {
    // arrange
    let mut registry = HandlerRegistry::new();
    registry.register("broken", |_, _, _| async { Ok(false) });
    let options = QueueOptions {
        retry_enabled: false,
        ..QueueOptions::default()
    };
    let fx = fixture(ManualClock::default(), registry, options);
    let job_id = fx.queue.enqueue("broken", json!(null)).await?;

    // act
    let report = completed(fx.runner.run().await?);

    // assert
    let job = job(&fx.store, job_id).await?;
    assert_eq!(1, report.failed);
    assert_eq!(JobStatus::Failed, job.status);
    assert_eq!(1, job.attempts);
    Ok(())
}

#[tokio::test]
async fn run_unknown_type_is_failure() -> anyhow::Result<()> {
    // arrange
    let fx = fixture(ManualClock::default(), HandlerRegistry::new(), QueueOptions::default());
    let job_id = fx.queue.enqueue("missing", json!(null)).await?;

    // act
    completed(fx.runner.run().await?);

    // assert
    let job = job(&fx.store, job_id).await?;
    assert_eq!(JobStatus::Pending, job.status);
    assert_eq!(1, job.attempts);
    assert_eq!(Some("no handler for type 'missing'"), job.last_error.as_deref());
    Ok(())
}

#[tokio::test]
async fn run_unknown_type_fails_after_max_attempts() -> anyhow::Result<()> {
    // arrange
    let options = QueueOptions::default();
    let max_attempts = options.max_attempts;
    let fx = fixture(ManualClock::default(), HandlerRegistry::new(), options);
    let job_id = fx.queue.enqueue("send_email", json!({"to": "a@b.com"})).await?;

    // act
    for _ in 0..max_attempts {
        let pending = job(&fx.store, job_id).await?;
        fx.clock.set(pending.available_at.max(fx.clock.now()));
        completed(fx.runner.run().await?);
    }
    let after = completed(fx.runner.run().await?);

    // assert
    let job = job(&fx.store, job_id).await?;
    assert_eq!(JobStatus::Failed, job.status);
    assert_eq!(max_attempts, job.attempts);
    assert!(job.last_error.unwrap_or_default().contains("no handler"));
    assert_eq!(0, after.claimed);
    Ok(())
}

/// Memory store whose success finalize always fails.
#[cfg(test)]
#[derive(Debug)]
struct BrokenFinalize(MemoryJobStore);

#[cfg(test)]
#[async_trait::async_trait]
impl JobStore for BrokenFinalize {
    async fn insert(
        &self,
        job_type: &str,
        payload: &serde_json::Value,
        available_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<i64, Error> {
        self.0.insert(job_type, payload, available_at).await
    }

    async fn get(&self, job_id: i64) -> Result<Option<Job>, Error> {
        self.0.get(job_id).await
    }

    async fn claim_batch(&self, limit: i64) -> Result<Vec<Job>, Error> {
        self.0.claim_batch(limit).await
    }

    async fn finalize_success(&self, _job_id: i64) -> Result<u64, Error> {
        Err(Error::DbError(sqlx::Error::PoolTimedOut))
    }

    async fn finalize_retry(
        &self,
        job_id: i64,
        attempts: i32,
        next_available_at: chrono::DateTime<chrono::Utc>,
        last_error: &str,
    ) -> Result<u64, Error> {
        self.0.finalize_retry(job_id, attempts, next_available_at, last_error).await
    }

    async fn finalize_permanent_failure(
        &self,
        job_id: i64,
        attempts: i32,
        last_error: &str,
    ) -> Result<u64, Error> {
        self.0.finalize_permanent_failure(job_id, attempts, last_error).await
    }

    async fn record_error(&self, job_id: i64, message: &str) -> Result<u64, Error> {
        self.0.record_error(job_id, message).await
    }

    async fn release(&self, job_ids: &[i64]) -> Result<u64, Error> {
        self.0.release(job_ids).await
    }

    async fn requeue_stale(&self, older_than: chrono::DateTime<chrono::Utc>) -> Result<u64, Error> {
        self.0.requeue_stale(older_than).await
    }

    async fn has_eligible_pending(&self) -> Result<bool, Error> {
        self.0.has_eligible_pending().await
    }

    async fn next_pending_at(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>, Error> {
        self.0.next_pending_at().await
    }
}

#[tokio::test]
async fn run_store_failure_releases_rest_of_batch() -> anyhow::Result<()> {
    // arrange
    let clock = ManualClock::default();
    let store = MemoryJobStore::new(Arc::new(clock.clone()));
    let lock = MemoryLock::new(Arc::new(clock.clone()));
    let (trigger, _rx) = trigger::channel();
    let queue = JobQueue::new(
        Arc::new(BrokenFinalize(store.clone())),
        Arc::new(trigger),
        Arc::new(clock),
    );
    let options = QueueOptions::default();
    let runner = BatchRunner::new(queue.clone(), Arc::new(lock.clone()), succeeding("noop"), options.clone());
    for _ in 0..3 {
        queue.enqueue("noop", json!(null)).await?;
    }

    // act
    let res = runner.run().await;

    // assert
    let jobs = store.all().await;
    assert!(matches!(res, Err(Error::DbError(_))));
    assert_eq!(JobStatus::Processing, jobs[0].status);
    assert!(jobs[1..].iter().all(|job| job.status == JobStatus::Pending));
    assert!(lock.acquire(&options.lock_key, options.lock_ttl).await?);
    Ok(())
}

#[tokio::test]
async fn run_survives_handler_panic() -> anyhow::Result<()> {
    // arrange
    let mut registry = succeeding("noop");
    registry.register("explode", |payload: serde_json::Value, _, _| async move {
        if payload.is_null() {
            panic!("kaboom");
        }
        Ok(true)
    });
    let fx = fixture(ManualClock::default(), registry, QueueOptions::default());
    let exploding = fx.queue.enqueue("explode", json!(null)).await?;
    let following = fx.queue.enqueue("noop", json!(null)).await?;

    // act
    let report = completed(fx.runner.run().await?);

    // assert
    let exploded = job(&fx.store, exploding).await?;
    assert_eq!(JobStatus::Pending, exploded.status);
    assert_eq!(Some("handler panicked: kaboom"), exploded.last_error.as_deref());
    assert_eq!(JobStatus::Done, job(&fx.store, following).await?.status);
    assert_eq!(1, report.retried);
    assert_eq!(1, report.succeeded);
    Ok(())
}

#[tokio::test]
async fn run_time_box_releases_rest() -> anyhow::Result<()> {
    // arrange
    let clock = ManualClock::default();
    let mut registry = HandlerRegistry::new();
    registry.register("slow", {
        let clock = clock.clone();
        move |_, _, _| {
            clock.advance(Duration::seconds(30));
            async { Ok(true) }
        }
    });
    let fx = fixture(clock, registry, QueueOptions::default());
    for _ in 0..5 {
        fx.queue.enqueue("slow", json!(null)).await?;
    }
    fx.rx.try_recv()?;

    // act
    let report = completed(fx.runner.run().await?);

    // assert
    let jobs = fx.store.all().await;
    assert!(report.timed_out);
    assert_eq!(2, report.succeeded);
    assert_eq!(3, report.released);
    assert_eq!(2, jobs.iter().filter(|job| job.status == JobStatus::Done).count());
    assert!(jobs[2..]
        .iter()
        .all(|job| job.status == JobStatus::Pending && job.attempts == 0));
    assert_eq!(1, fx.rx.len());
    Ok(())
}

#[tokio::test]
async fn run_skips_when_lock_held() -> anyhow::Result<()> {
    // arrange
    let options = QueueOptions::default();
    let fx = fixture(ManualClock::default(), succeeding("noop"), options.clone());
    let job_id = fx.queue.enqueue("noop", json!(null)).await?;
    assert!(fx.lock.acquire(&options.lock_key, options.lock_ttl).await?);

    // act
    let outcome = fx.runner.run().await?;

    // assert
    assert_eq!(RunOutcome::Locked, outcome);
    assert_eq!(JobStatus::Pending, job(&fx.store, job_id).await?.status);
    Ok(())
}

#[tokio::test]
async fn run_overlapping_runs_are_exclusive() -> anyhow::Result<()> {
    // arrange
    let started = Arc::new(Notify::new());
    let proceed = Arc::new(Notify::new());
    let mut registry = HandlerRegistry::new();
    registry.register("gate", {
        let started = Arc::clone(&started);
        let proceed = Arc::clone(&proceed);
        move |_, _, _| {
            let started = Arc::clone(&started);
            let proceed = Arc::clone(&proceed);
            async move {
                started.notify_one();
                proceed.notified().await;
                Ok(true)
            }
        }
    });
    let fx = fixture(ManualClock::default(), registry, QueueOptions::default());
    let job_id = fx.queue.enqueue("gate", json!(null)).await?;

    // act
    let first = tokio::spawn({
        let runner = Arc::clone(&fx.runner);
        async move { runner.run().await }
    });
    started.notified().await;
    let second = fx.runner.run().await?;
    proceed.notify_one();
    let first = first.await??;

    // assert
    assert_eq!(RunOutcome::Locked, second);
    assert_eq!(1, completed(first).succeeded);
    assert_eq!(JobStatus::Done, job(&fx.store, job_id).await?.status);
    assert!(matches!(fx.runner.run().await?, RunOutcome::Completed(_)));
    Ok(())
}

#[tokio::test]
async fn run_releases_lock_on_error() -> anyhow::Result<()> {
    // arrange
    let options = QueueOptions {
        stale_after: std::time::Duration::MAX,
        ..QueueOptions::default()
    };
    let fx = fixture(ManualClock::default(), succeeding("noop"), options.clone());

    // act
    let res = fx.runner.run().await;

    // assert
    assert!(matches!(res, Err(Error::InvalidParams("stale_after"))));
    assert!(fx.lock.acquire(&options.lock_key, options.lock_ttl).await?);
    Ok(())
}

#[tokio::test]
async fn run_requeues_stale_claims() -> anyhow::Result<()> {
    // arrange
    let fx = fixture(ManualClock::default(), succeeding("noop"), QueueOptions::default());
    let job_id = fx.queue.enqueue("noop", json!(null)).await?;
    assert_eq!(1, fx.store.claim_batch(10).await?.len());
    fx.clock.advance(Duration::seconds(601));

    // act
    let report = completed(fx.runner.run().await?);

    // assert
    assert_eq!(1, report.requeued_stale);
    assert_eq!(1, report.succeeded);
    assert_eq!(JobStatus::Done, job(&fx.store, job_id).await?.status);
    Ok(())
}

#[tokio::test]
async fn run_leaves_delayed_jobs_alone() -> anyhow::Result<()> {
    // arrange
    let fx = fixture(ManualClock::default(), succeeding("noop"), QueueOptions::default());
    let job_id = fx.queue.enqueue_in("noop", json!(null), 120).await?;

    // act
    let report = completed(fx.runner.run().await?);

    // assert
    assert_eq!(0, report.claimed);
    assert_eq!(JobStatus::Pending, job(&fx.store, job_id).await?.status);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn run_rearms_for_retry() -> anyhow::Result<()> {
    // arrange
    let mut registry = HandlerRegistry::new();
    registry.register("broken", |_, _, _| async { Ok(false) });
    let fx = fixture(ManualClock::default(), registry, QueueOptions::default());
    fx.queue.enqueue("broken", json!(null)).await?;
    fx.rx.try_recv()?;

    // act
    completed(fx.runner.run().await?);
    let immediately = fx.rx.len();
    tokio::time::sleep(std::time::Duration::from_secs(61)).await;

    // assert
    assert_eq!(0, immediately);
    assert_eq!(1, fx.rx.len());
    Ok(())
}
