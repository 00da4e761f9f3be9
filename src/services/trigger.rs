use async_channel::{Receiver, Sender, TrySendError};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use crate::models::Error;

/// Whatever wakes the batch runner.
#[async_trait]
pub trait Trigger: Send + Sync + std::fmt::Debug {
    /// Ask for a run as soon as possible.
    async fn run_now(&self) -> Result<(), Error>;

    /// Ask for a run after `delay`, unless an earlier delayed run is already
    /// scheduled.
    async fn run_after(&self, delay: Duration) -> Result<(), Error>;
}

/// Coalescing trigger over a one-slot channel.
///
/// Any number of `run_now` calls between two runs collapse into a single
/// wake-up of the receiving [`TriggerService`](super::TriggerService).
/// Delayed runs keep only the earliest outstanding deadline.
#[derive(Debug, Clone)]
pub struct ChannelTrigger {
    tx: Sender<()>,
    deadline: Arc<Mutex<Option<Instant>>>,
}

pub fn channel() -> (ChannelTrigger, Receiver<()>) {
    let (tx, rx) = async_channel::bounded::<()>(1);
    let trigger = ChannelTrigger {
        tx,
        deadline: Arc::new(Mutex::new(None)),
    };
    (trigger, rx)
}

impl ChannelTrigger {
    fn notify(&self) -> Result<(), Error> {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => Ok(()),
            Err(TrySendError::Closed(())) => Err(Error::TriggerClosed),
        }
    }
}

#[async_trait]
impl Trigger for ChannelTrigger {
    async fn run_now(&self) -> Result<(), Error> {
        self.notify()
    }

    async fn run_after(&self, delay: Duration) -> Result<(), Error> {
        if self.tx.is_closed() {
            return Err(Error::TriggerClosed);
        }
        let at = Instant::now() + delay;
        {
            let mut deadline = self.deadline.lock().await;
            if matches!(*deadline, Some(armed) if armed <= at) {
                debug!({ delay_ms = delay.as_millis() as u64 }, "earlier delayed run already scheduled");
                return Ok(());
            }
            *deadline = Some(at);
        }
        let trigger = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            {
                let mut deadline = trigger.deadline.lock().await;
                if *deadline == Some(at) {
                    *deadline = None;
                }
            }
            if let Err(err) = trigger.notify() {
                warn!("delayed trigger dropped {}", err);
            }
        });
        Ok(())
    }
}

#[tokio::test]
async fn trigger_run_now_coalesces() -> anyhow::Result<()> {
    // arrange
    let (trigger, rx) = channel();

    // act
    trigger.run_now().await?;
    trigger.run_now().await?;
    trigger.run_now().await?;

    // assert
    assert_eq!(1, rx.len());
    Ok(())
}

#[tokio::test]
async fn trigger_closed_is_error() -> anyhow::Result<()> {
    // arrange
    let (trigger, rx) = channel();
    drop(rx);

    // act
    let now = trigger.run_now().await;
    let later = trigger.run_after(Duration::from_secs(1)).await;

    // assert
    assert!(matches!(now, Err(Error::TriggerClosed)));
    assert!(matches!(later, Err(Error::TriggerClosed)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn trigger_run_after_earlier_request_wins() -> anyhow::Result<()> {
    // arrange
    let (trigger, rx) = channel();

    // act
    trigger.run_after(Duration::from_secs(3600)).await?;
    trigger.run_after(Duration::from_secs(5)).await?;
    tokio::time::sleep(Duration::from_secs(4)).await;
    let early = rx.len();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // assert
    assert_eq!(0, early);
    assert_eq!(1, rx.len());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn trigger_run_after_later_request_is_coalesced() -> anyhow::Result<()> {
    // arrange
    let (trigger, rx) = channel();

    // act
    trigger.run_after(Duration::from_secs(5)).await?;
    trigger.run_after(Duration::from_secs(60)).await?;
    tokio::time::sleep(Duration::from_secs(6)).await;
    let first = rx.try_recv();
    tokio::time::sleep(Duration::from_secs(60)).await;

    // assert
    assert!(first.is_ok());
    assert!(rx.is_empty());
    Ok(())
}
