use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;

use super::Lock;
use crate::models::{Clock, Error, SystemClock};

/// In-process [`Lock`] keyed by name, with expiry taken from a [`Clock`].
#[derive(Debug, Clone)]
pub struct MemoryLock {
    held: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }
}

impl Default for MemoryLock {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl Lock for MemoryLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| Error::InvalidParams("lock_ttl"))?;
        let mut held = self.held.lock().await;
        if let Some(expires_at) = held.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        held.insert(key.to_owned(), now + ttl);
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<(), Error> {
        self.held.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
use crate::models::ManualClock;

#[cfg(test)]
const KEY: &str = "run";
#[cfg(test)]
const TTL: Duration = Duration::from_secs(60);

#[tokio::test]
async fn acquire_is_exclusive() -> anyhow::Result<()> {
    // arrange
    let lock = MemoryLock::default();

    // act
    let first = lock.acquire(KEY, TTL).await?;
    let second = lock.acquire(KEY, TTL).await?;
    let other = lock.acquire("other", TTL).await?;

    // assert
    assert!(first);
    assert!(!second);
    assert!(other);
    Ok(())
}

#[tokio::test]
async fn release_allows_reacquire() -> anyhow::Result<()> {
    // arrange
    let lock = MemoryLock::default();
    lock.acquire(KEY, TTL).await?;

    // act
    lock.release(KEY).await?;
    let again = lock.acquire(KEY, TTL).await?;

    // assert
    assert!(again);
    Ok(())
}

#[tokio::test]
async fn release_without_acquire_is_noop() -> anyhow::Result<()> {
    // arrange
    let lock = MemoryLock::default();

    // act & assert
    lock.release(KEY).await?;
    lock.release(KEY).await?;
    assert!(lock.acquire(KEY, TTL).await?);
    Ok(())
}

#[tokio::test]
async fn expired_lock_can_be_taken() -> anyhow::Result<()> {
    // arrange
    let clock = ManualClock::default();
    let lock = MemoryLock::new(Arc::new(clock.clone()));
    lock.acquire(KEY, TTL).await?;

    // act
    clock.advance(chrono::Duration::seconds(59));
    let before_expiry = lock.acquire(KEY, TTL).await?;
    clock.advance(chrono::Duration::seconds(1));
    let after_expiry = lock.acquire(KEY, TTL).await?;

    // assert
    assert!(!before_expiry);
    assert!(after_expiry);
    Ok(())
}
