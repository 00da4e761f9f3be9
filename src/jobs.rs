//! Handlers the binary registers out of the box.

#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use crate::{models::Job, registry::HandlerRegistry, services::JobQueue};

pub const NOOP: &str = "noop";
pub const LOG: &str = "log";

pub fn builtin() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(NOOP, |_, _, _| async { Ok(true) })
        .register(LOG, log);
    registry
}

async fn log(payload: serde_json::Value, job: Job, _queue: JobQueue) -> crate::registry::HandlerResult {
    let Job { id: job_id, attempts, .. } = job;
    info!({ job_id, attempts }, "payload {}", payload);
    Ok(true)
}

#[cfg(test)]
use crate::lock::MemoryLock;
#[cfg(test)]
use crate::models::{JobStatus, QueueOptions, SystemClock};
#[cfg(test)]
use crate::services::{trigger, BatchRunner, RunOutcome};
#[cfg(test)]
use crate::store::MemoryJobStore;
#[cfg(test)]
use serde_json::json;
#[cfg(test)]
use std::sync::Arc;

#[tokio::test]
async fn builtin_handlers_succeed() -> anyhow::Result<()> {
    // arrange
    let store = MemoryJobStore::default();
    let (trigger, _rx) = trigger::channel();
    let queue = JobQueue::new(Arc::new(store.clone()), Arc::new(trigger), Arc::new(SystemClock));
    let runner = BatchRunner::new(
        queue.clone(),
        Arc::new(MemoryLock::default()),
        builtin(),
        QueueOptions::default(),
    );
    queue.enqueue(NOOP, json!(null)).await?;
    queue.enqueue(LOG, json!({"hello": "world"})).await?;

    // act
    let outcome = runner.run().await?;

    // assert
    assert!(matches!(outcome, RunOutcome::Completed(ref report) if report.succeeded == 2));
    assert!(store.all().await.iter().all(|job| job.status == JobStatus::Done));
    Ok(())
}
