use async_channel::Receiver;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    Pool, Postgres,
};
use std::{str::FromStr, sync::Arc};
use tokio_util::sync::CancellationToken;

use super::{Clock, Error, Settings, SystemClock};
use crate::{
    db::{PgJobStore, PgLock},
    registry::HandlerRegistry,
    services::{trigger, BatchRunner, JobQueue, TriggerService},
};

#[derive(Debug)]
pub struct AppState {
    pub instance_id: String,
    pub pool: Pool<Postgres>,
    pub queue: JobQueue,
    pub runner: Arc<BatchRunner>,
    pub settings: Settings,
    pub shutdown_token: CancellationToken,
    trigger_rx: Receiver<()>,
}

impl AppState {
    pub async fn new(settings: Settings, registry: HandlerRegistry) -> Result<Arc<AppState>, Error> {
        let hostname = whoami::hostname();
        let instance_id = format!("{}:{}", hostname, std::process::id());
        let db_url = settings
            .database_url
            .as_deref()
            .ok_or(Error::InvalidParams("DATABASE_URL"))?;
        let conn = PgConnectOptions::from_str(db_url)?.application_name(&instance_id);

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect_with(conn)
            .await?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (trigger, trigger_rx) = trigger::channel();
        let queue = JobQueue::new(
            Arc::new(PgJobStore::new(pool.clone(), Arc::clone(&clock))),
            Arc::new(trigger),
            Arc::clone(&clock),
        );
        let runner = BatchRunner::new(
            queue.clone(),
            Arc::new(PgLock::new(pool.clone(), clock)),
            registry,
            settings.queue.clone(),
        );

        Ok(AppState::from_parts(
            instance_id,
            pool,
            queue,
            runner,
            trigger_rx,
            settings,
        ))
    }

    /// Assemble a state around an already built queue and runner.
    pub fn from_parts(
        instance_id: String,
        pool: Pool<Postgres>,
        queue: JobQueue,
        runner: BatchRunner,
        trigger_rx: Receiver<()>,
        settings: Settings,
    ) -> Arc<AppState> {
        let state = AppState {
            instance_id,
            pool,
            queue,
            runner: Arc::new(runner),
            settings,
            shutdown_token: CancellationToken::new(),
            trigger_rx,
        };
        Arc::new(state)
    }

    pub fn trigger_service(&self) -> TriggerService {
        TriggerService::new(
            self.instance_id.clone(),
            Arc::clone(&self.runner),
            self.trigger_rx.clone(),
            self.settings.trigger.schedule.clone(),
            self.shutdown_token.clone(),
        )
    }
}
