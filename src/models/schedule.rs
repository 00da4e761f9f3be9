use std::{fmt::Display, str::FromStr};

use super::Error;
use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

/// Recurring wake-up of the trigger service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSchedule {
    /// Interval in seconds
    Interval { interval: u32 },
    /// Cron string
    Cron { cron: String },
}

impl TriggerSchedule {
    /// Next fire time strictly after `after`, in unix seconds.
    pub fn next(&self, after_unix_sec: i64) -> Option<i64> {
        match &self {
            TriggerSchedule::Interval { interval } => {
                let interval = i64::from(*interval).max(1);
                Some(after_unix_sec - after_unix_sec.rem_euclid(interval) + interval)
            }
            TriggerSchedule::Cron { cron } => {
                let dt = Utc.timestamp_opt(after_unix_sec, 0).single()?;
                Schedule::from_str(cron)
                    .ok()?
                    .after(&dt)
                    .map(|dt| dt.timestamp())
                    .next()
            }
        }
    }

    /// Time left until the next fire, measured from `now`.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let next_at = self.next(now.timestamp())?;
        let next_at = Utc.timestamp_opt(next_at, 0).single()?;
        (next_at - now).to_std().ok()
    }
}

impl Default for TriggerSchedule {
    fn default() -> Self {
        TriggerSchedule::Interval { interval: 60 }
    }
}

impl FromStr for TriggerSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::InvalidParams("schedule"));
        }
        if let Ok(interval) = s.parse::<u32>() {
            if interval == 0 {
                return Err(Error::InvalidParams("schedule"));
            }
            return Ok(TriggerSchedule::Interval { interval });
        }
        let mut parts: Vec<&str> = s.split(['|', ' ']).collect();
        let fixed: String = match parts.len() {
            5 => {
                parts.insert(0, "0");
                Ok(parts.join(" "))
            }
            6 | 7 => Ok(parts.join(" ")),
            _ => Err(Error::InvalidParams("schedule")),
        }?;
        let schedule = Schedule::from_str(&fixed).map_err(|_| Error::InvalidParams("schedule"))?;
        Ok(TriggerSchedule::Cron {
            cron: schedule.to_string(),
        })
    }
}

impl Display for TriggerSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            TriggerSchedule::Interval { interval } => write!(f, "{}", interval),
            TriggerSchedule::Cron { cron } => write!(f, "{}", cron),
        }
    }
}

#[tokio::test]
async fn schedule_from_str_err() -> anyhow::Result<()> {
    // arrange
    let s = "";
    // act
    let schedule: Result<TriggerSchedule, _> = s.parse();

    // assert
    assert!(schedule.is_err());
    assert!("0".parse::<TriggerSchedule>().is_err());
    assert!("* *".parse::<TriggerSchedule>().is_err());
    Ok(())
}

#[tokio::test]
async fn schedule_from_str_interval() -> anyhow::Result<()> {
    // arrange
    let s = "300";
    // act
    let schedule: TriggerSchedule = s.parse()?;

    // assert
    assert_eq!(TriggerSchedule::Interval { interval: 300 }, schedule);
    assert_eq!(s, schedule.to_string());
    Ok(())
}

#[tokio::test]
async fn schedule_from_str_cron() -> anyhow::Result<()> {
    // arrange
    let s = "*/5 * * * *";
    // act
    let schedule: TriggerSchedule = s.parse()?;

    // assert
    assert_eq!(
        TriggerSchedule::Cron {
            cron: "0 */5 * * * *".into()
        },
        schedule
    );
    assert_eq!("0 */5 * * * *", schedule.to_string());
    Ok(())
}

#[tokio::test]
async fn schedule_next_interval_is_aligned() -> anyhow::Result<()> {
    // arrange
    let schedule = TriggerSchedule::Interval { interval: 60 };

    // act & assert
    assert_eq!(Some(120), schedule.next(61));
    assert_eq!(Some(180), schedule.next(120));
    Ok(())
}

#[tokio::test]
async fn schedule_next_cron() -> anyhow::Result<()> {
    // arrange
    let schedule: TriggerSchedule = "*/5 * * * *".parse()?;

    // act
    let next = schedule.next(1_700_000_000);

    // assert
    // 1_700_000_000 is 2023-11-14T22:13:20Z
    assert_eq!(Some(1_700_000_100), next);
    Ok(())
}

#[tokio::test]
async fn schedule_next_delay() -> anyhow::Result<()> {
    // arrange
    let schedule = TriggerSchedule::Interval { interval: 60 };
    let now = Utc.timestamp_opt(1_700_000_030, 0).single().unwrap();

    // act
    let delay = schedule.next_delay(now);

    // assert
    assert_eq!(Some(std::time::Duration::from_secs(10)), delay);
    Ok(())
}
