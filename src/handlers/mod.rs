pub mod jobs;
pub mod live;

#[cfg(test)]
pub(crate) mod testing {
    use crate::{
        lock::MemoryLock,
        models::{AppState, Settings, SystemClock},
        registry::HandlerRegistry,
        services::{trigger, BatchRunner, JobQueue},
        store::MemoryJobStore,
    };
    use async_channel::Receiver;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    /// State over the in-memory store; the pool is lazy and never connects.
    pub fn state() -> anyhow::Result<(Arc<AppState>, MemoryJobStore, Receiver<()>)> {
        let settings = Settings::from_lookup(|_| None)?;
        let store = MemoryJobStore::default();
        let (trigger, rx) = trigger::channel();
        let queue = JobQueue::new(Arc::new(store.clone()), Arc::new(trigger), Arc::new(SystemClock));
        let runner = BatchRunner::new(
            queue.clone(),
            Arc::new(MemoryLock::default()),
            HandlerRegistry::new(),
            settings.queue.clone(),
        );
        let pool = PgPoolOptions::new().connect_lazy("postgres://localhost/jobbus")?;
        let state = AppState::from_parts("test:1".to_owned(), pool, queue, runner, rx.clone(), settings);
        Ok((state, store, rx))
    }
}
