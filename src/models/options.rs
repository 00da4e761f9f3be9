use std::{str::FromStr, time::Duration};

use dotenv::dotenv;

use super::{Backoff, Error, TriggerSchedule};

/// Queue behaviour, fixed when the runner is built.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    pub batch_size: i64,
    pub run_timeout: Duration,
    pub lock_key: String,
    pub lock_ttl: Duration,
    pub max_attempts: i32,
    pub retry_enabled: bool,
    pub backoff: Backoff,
    /// Claims older than this are considered orphaned by a crashed run.
    pub stale_after: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            batch_size: 25,
            run_timeout: Duration::from_secs(45),
            lock_key: "jobbus_run_lock".to_owned(),
            lock_ttl: Duration::from_secs(60),
            max_attempts: 5,
            retry_enabled: true,
            backoff: Backoff::default(),
            stale_after: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TriggerOptions {
    pub schedule: TriggerSchedule,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub http_port: u16,
    pub queue: QueueOptions,
    pub trigger: TriggerOptions,
}

impl Settings {
    pub fn from_env() -> Result<Settings, Error> {
        dotenv().ok();
        Settings::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Settings, Error> {
        let defaults = QueueOptions::default();
        let queue = QueueOptions {
            batch_size: parse_or(&lookup, "QUEUE_BATCH_SIZE", defaults.batch_size)?,
            run_timeout: secs_or(&lookup, "QUEUE_RUN_TIMEOUT_SECS", defaults.run_timeout)?,
            lock_key: lookup("QUEUE_LOCK_KEY").unwrap_or(defaults.lock_key),
            lock_ttl: secs_or(&lookup, "QUEUE_LOCK_TTL_SECS", defaults.lock_ttl)?,
            max_attempts: parse_or(&lookup, "QUEUE_MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_enabled: parse_or(&lookup, "QUEUE_RETRY_ENABLED", defaults.retry_enabled)?,
            backoff: parse_or(&lookup, "QUEUE_BACKOFF", defaults.backoff)?,
            stale_after: secs_or(&lookup, "QUEUE_STALE_AFTER_SECS", defaults.stale_after)?,
        };
        if queue.batch_size < 1 {
            return Err(Error::InvalidParams("QUEUE_BATCH_SIZE"));
        }
        if queue.max_attempts < 1 {
            return Err(Error::InvalidParams("QUEUE_MAX_ATTEMPTS"));
        }
        Ok(Settings {
            database_url: lookup("DATABASE_URL"),
            max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 16)?,
            http_port: parse_or(&lookup, "HTTP_PORT", 8102)?,
            queue,
            trigger: TriggerOptions {
                schedule: parse_or(&lookup, "TRIGGER_SCHEDULE", TriggerSchedule::default())?,
            },
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, Error> {
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| Error::InvalidParams(key)),
        None => Ok(default),
    }
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, Error> {
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

#[tokio::test]
async fn settings_defaults() -> anyhow::Result<()> {
    // act
    let settings = Settings::from_lookup(|_| None)?;

    // assert
    assert_eq!(QueueOptions::default(), settings.queue);
    assert_eq!(25, settings.queue.batch_size);
    assert_eq!(Duration::from_secs(45), settings.queue.run_timeout);
    assert_eq!(Duration::from_secs(60), settings.queue.lock_ttl);
    assert_eq!(5, settings.queue.max_attempts);
    assert!(settings.queue.retry_enabled);
    assert_eq!(&Backoff::DEFAULT_DELAYS[..], settings.queue.backoff.delays());
    assert_eq!(8102, settings.http_port);
    assert_eq!(None, settings.database_url);
    Ok(())
}

#[tokio::test]
async fn settings_from_lookup() -> anyhow::Result<()> {
    // arrange
    let lookup = |key: &str| match key {
        "QUEUE_BATCH_SIZE" => Some("10".to_owned()),
        "QUEUE_RETRY_ENABLED" => Some("false".to_owned()),
        "QUEUE_BACKOFF" => Some("5|10".to_owned()),
        "TRIGGER_SCHEDULE" => Some("*/5 * * * *".to_owned()),
        _ => None,
    };

    // act
    let settings = Settings::from_lookup(lookup)?;

    // assert
    assert_eq!(10, settings.queue.batch_size);
    assert!(!settings.queue.retry_enabled);
    assert_eq!(&[5, 10], settings.queue.backoff.delays());
    assert!(matches!(settings.trigger.schedule, TriggerSchedule::Cron { .. }));
    Ok(())
}

#[tokio::test]
async fn settings_from_lookup_err() -> anyhow::Result<()> {
    // arrange
    let lookup = |key: &str| (key == "QUEUE_MAX_ATTEMPTS").then(|| "many".to_owned());

    // act
    let settings = Settings::from_lookup(lookup);

    // assert
    assert!(matches!(settings, Err(Error::InvalidParams("QUEUE_MAX_ATTEMPTS"))));
    Ok(())
}
