use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Time source shared by the queue, the runner and the stores.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    nanos: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            nanos: Arc::new(AtomicI64::new(start.timestamp_nanos_opt().unwrap_or_default())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = by.num_nanoseconds().unwrap_or_default();
        self.nanos.fetch_add(by, Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.nanos
            .store(at.timestamp_nanos_opt().unwrap_or_default(), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

#[tokio::test]
async fn manual_clock_advance() -> anyhow::Result<()> {
    // arrange
    let start = Utc::now();
    let clock = ManualClock::new(start);
    let shared = clock.clone();

    // act
    shared.advance(Duration::seconds(90));

    // assert
    assert_eq!(90, (clock.now() - start).num_seconds());
    Ok(())
}
