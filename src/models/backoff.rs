use super::Error;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

/// Fixed ascending retry delays, in seconds.
///
/// Attempt numbers are 1-based; attempts past the end of the sequence reuse
/// the last delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    delays: Vec<u32>,
}

impl Backoff {
    pub const DEFAULT_DELAYS: [u32; 5] = [60, 300, 900, 3600, 21600];

    pub fn new(delays: Vec<u32>) -> Result<Self, Error> {
        if delays.is_empty() {
            return Err(Error::InvalidParams("backoff"));
        }
        if delays.windows(2).any(|w| w[1] < w[0]) {
            return Err(Error::InvalidParams("backoff"));
        }
        Ok(Backoff { delays })
    }

    pub fn delay_for(&self, attempt: u32) -> u32 {
        let idx = (attempt.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[idx]
    }

    pub fn delays(&self) -> &[u32] {
        &self.delays
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            delays: Self::DEFAULT_DELAYS.to_vec(),
        }
    }
}

impl FromStr for Backoff {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let delays = s
            .split(['|', ','])
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| part.parse::<u32>().map_err(|_| Error::InvalidParams("backoff")))
            .collect::<Result<Vec<_>, _>>()?;
        Backoff::new(delays)
    }
}

impl Display for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.delays.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join(","))
    }
}

#[tokio::test]
async fn backoff_default_sequence() -> anyhow::Result<()> {
    // arrange
    let backoff = Backoff::default();

    // act & assert
    assert_eq!(60, backoff.delay_for(1));
    assert_eq!(300, backoff.delay_for(2));
    assert_eq!(900, backoff.delay_for(3));
    assert_eq!(3600, backoff.delay_for(4));
    assert_eq!(21600, backoff.delay_for(5));
    Ok(())
}

#[tokio::test]
async fn backoff_clamps_to_last() -> anyhow::Result<()> {
    // arrange
    let backoff = Backoff::default();

    // act & assert
    assert_eq!(21600, backoff.delay_for(6));
    assert_eq!(21600, backoff.delay_for(100));
    assert_eq!(21600, backoff.delay_for(u32::MAX));
    assert_eq!(60, backoff.delay_for(0));
    Ok(())
}

#[tokio::test]
async fn backoff_is_non_decreasing() -> anyhow::Result<()> {
    // arrange
    let backoff: Backoff = "5,5,30,120".parse()?;

    // act
    let delays: Vec<u32> = (1..=8).map(|attempt| backoff.delay_for(attempt)).collect();

    // assert
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(vec![5, 5, 30, 120, 120, 120, 120, 120], delays);
    Ok(())
}

#[tokio::test]
async fn backoff_from_str_err() -> anyhow::Result<()> {
    // act & assert
    assert!("".parse::<Backoff>().is_err());
    assert!("60,abc".parse::<Backoff>().is_err());
    assert!("300|60".parse::<Backoff>().is_err());
    Ok(())
}

#[tokio::test]
async fn backoff_display_round_trip() -> anyhow::Result<()> {
    // arrange
    let s = "60|300|900";
    // act
    let backoff: Backoff = s.parse()?;

    // assert
    assert_eq!("60,300,900", backoff.to_string());
    Ok(())
}
