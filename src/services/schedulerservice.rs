use async_channel::Receiver;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

use super::{BatchRunner, RunOutcome};
use crate::models::{Error, TriggerSchedule};

/// Wakes the [`BatchRunner`] on explicit triggers and on a recurring schedule.
#[derive(Debug)]
pub struct TriggerService {
    instance_id: String,
    runner: Arc<BatchRunner>,
    rx: Receiver<()>,
    schedule: TriggerSchedule,
    shutdown_token: CancellationToken,
}

impl TriggerService {
    pub fn new(
        instance_id: impl Into<String>,
        runner: Arc<BatchRunner>,
        rx: Receiver<()>,
        schedule: TriggerSchedule,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            runner,
            rx,
            schedule,
            shutdown_token,
        }
    }

    pub async fn run(&self) -> Result<(), Error> {
        let instance_id = &self.instance_id;
        info!({ instance_id, schedule = %self.schedule }, "start");
        while !self.shutdown_token.is_cancelled() {
            // a schedule with no upcoming fire time leaves only explicit triggers
            let next_delay = self.schedule.next_delay(Utc::now());
            select!(
                biased;
                _ = self.shutdown_token.cancelled() => break,
                res = self.rx.recv() => {
                    if res.is_err() {
                        warn!({ instance_id }, "trigger channel closed");
                        break;
                    }
                    trace!({ instance_id }, "triggered");
                },
                _ = sleep_or_pending(next_delay) => {
                    trace!({ instance_id }, "scheduled tick");
                },
            );
            self.tick().await;
        }
        info!({ instance_id }, "stop");
        Ok(())
    }

    async fn tick(&self) {
        let instance_id = &self.instance_id;
        match self.runner.run().await {
            Ok(RunOutcome::Locked) => debug!({ instance_id }, "runner busy"),
            Ok(RunOutcome::Completed(report)) if report.claimed > 0 || report.requeued_stale > 0 => {
                info!({ instance_id }, "run {:?}", report);
            }
            Ok(RunOutcome::Completed(_)) => trace!({ instance_id }, "nothing to run"),
            Err(err) => error!({ instance_id }, "run error {}", err),
        }
    }
}

async fn sleep_or_pending(delay: Option<Duration>) {
    match delay {
        Some(delay) => time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
use crate::lock::MemoryLock;
#[cfg(test)]
use crate::models::{JobStatus, QueueOptions, SystemClock};
#[cfg(test)]
use crate::registry::HandlerRegistry;
#[cfg(test)]
use crate::services::{trigger, JobQueue};
#[cfg(test)]
use crate::store::MemoryJobStore;
#[cfg(test)]
use serde_json::json;

#[tokio::test]
async fn service_runs_on_trigger_and_stops_on_cancel() -> anyhow::Result<()> {
    // arrange
    let store = MemoryJobStore::default();
    let (trigger, rx) = trigger::channel();
    let queue = JobQueue::new(Arc::new(store.clone()), Arc::new(trigger), Arc::new(SystemClock));
    let mut registry = HandlerRegistry::new();
    registry.register("noop", |_, _, _| async { Ok(true) });
    let runner = BatchRunner::new(
        queue.clone(),
        Arc::new(MemoryLock::default()),
        registry,
        QueueOptions::default(),
    );
    let token = CancellationToken::new();
    let service = TriggerService::new(
        "test:1",
        Arc::new(runner),
        rx,
        "3600".parse()?,
        token.clone(),
    );
    let handle = tokio::spawn(async move { service.run().await });

    // act
    let job_id = queue.enqueue("noop", json!(null)).await?;
    let mut status = JobStatus::Pending;
    for _ in 0..100 {
        status = store.all().await[0].status;
        if status == JobStatus::Done {
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    token.cancel();
    let stopped = time::timeout(Duration::from_secs(1), handle).await??;

    // assert
    assert_eq!(1, job_id);
    assert_eq!(JobStatus::Done, status);
    assert!(stopped.is_ok());
    Ok(())
}
