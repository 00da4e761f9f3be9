//! Mutual exclusion for batch runs.
//!
//! A [`Lock`] is a TTL-bound marker in a store shared by every runner. The TTL
//! lets a crashed runner's marker expire on its own.

use async_trait::async_trait;
use std::time::Duration;

use crate::models::Error;

pub use memory::MemoryLock;

mod memory;

#[async_trait]
pub trait Lock: Send + Sync + std::fmt::Debug {
    /// Create the marker for `key` unless an unexpired one exists.
    /// Returns `true` iff this call created it.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, Error>;

    /// Remove the marker for `key`. Releasing a key that is not held is a no-op.
    async fn release(&self, key: &str) -> Result<(), Error>;
}
