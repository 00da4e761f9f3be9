use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::models::Job;
use crate::services::JobQueue;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// `Ok(true)` is the only success signal; `Ok(false)` and `Err` are failures.
pub type HandlerResult = Result<bool, BoxError>;

type HandlerFn = dyn Fn(serde_json::Value, Job, JobQueue) -> BoxFuture<'static, HandlerResult>
    + Send
    + Sync;

pub type BoxedHandler = Arc<HandlerFn>;

/// Maps job type strings to handlers.
///
/// Registering a type twice replaces the earlier handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler receiving `(payload, job, queue)`.
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(serde_json::Value, Job, JobQueue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: BoxedHandler = Arc::new(
            move |payload, job, queue| -> BoxFuture<'static, HandlerResult> {
                Box::pin(handler(payload, job, queue))
            },
        );
        self.handlers.insert(job_type.into(), boxed);
        self
    }

    /// Register a handler whose payload is decoded into `P` first. A payload
    /// that does not decode is a handler failure.
    pub fn register_json<P, F, Fut>(&mut self, job_type: impl Into<String>, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, Job, JobQueue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(job_type, move |payload, job, queue| {
            let handler = Arc::clone(&handler);
            async move {
                let args: P = serde_json::from_value(payload)?;
                handler(args, job, queue).await
            }
        })
    }

    pub fn resolve(&self, job_type: &str) -> Option<BoxedHandler> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
use crate::models::{JobStatus, SystemClock};
#[cfg(test)]
use crate::services::trigger;
#[cfg(test)]
use crate::store::MemoryJobStore;
#[cfg(test)]
use chrono::Utc;
#[cfg(test)]
use serde::Deserialize;
#[cfg(test)]
use serde_json::json;

#[cfg(test)]
fn fixture(payload: serde_json::Value) -> (Job, JobQueue) {
    let now = Utc::now();
    let job = Job {
        id: 1,
        job_type: "t".into(),
        status: JobStatus::Processing,
        payload,
        attempts: 0,
        last_error: None,
        available_at: now,
        created_at: now,
        updated_at: now,
    };
    let (trigger, _rx) = trigger::channel();
    let queue = JobQueue::new(
        Arc::new(MemoryJobStore::default()),
        Arc::new(trigger),
        Arc::new(SystemClock),
    );
    (job, queue)
}

#[cfg(test)]
async fn call(registry: &HandlerRegistry, job_type: &str, payload: serde_json::Value) -> HandlerResult {
    let handler = registry.resolve(job_type).expect("handler");
    let (job, queue) = fixture(payload.clone());
    handler(payload, job, queue).await
}

#[tokio::test]
async fn resolve_unknown_is_none() -> anyhow::Result<()> {
    // arrange
    let registry = HandlerRegistry::new();

    // act & assert
    assert!(registry.resolve("missing").is_none());
    Ok(())
}

#[tokio::test]
async fn last_registration_wins() -> anyhow::Result<()> {
    // arrange
    let mut registry = HandlerRegistry::new();
    registry
        .register("t", |_, _, _| async { Ok(false) })
        .register("t", |_, _, _| async { Ok(true) });

    // act
    let ok = call(&registry, "t", json!(null)).await.map_err(|e| anyhow::anyhow!(e))?;

    // assert
    assert!(ok);
    assert_eq!(vec!["t"], registry.job_types().collect::<Vec<_>>());
    Ok(())
}

#[cfg(test)]
#[derive(Deserialize)]
struct Email {
    to: String,
}

#[tokio::test]
async fn register_json_decodes_payload() -> anyhow::Result<()> {
    // arrange
    let mut registry = HandlerRegistry::new();
    registry.register_json("send_email", |email: Email, _, _| async move {
        Ok(email.to == "a@b.com")
    });

    // act
    let ok = call(&registry, "send_email", json!({"to": "a@b.com"}))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    let bad = call(&registry, "send_email", json!({"from": "a@b.com"})).await;

    // assert
    assert!(ok);
    assert!(bad.is_err());
    Ok(())
}
