use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use super::Error;

/// Longest `last_error` kept on a row, in characters.
pub const MAX_ERROR_LEN: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::UnknownStatus(other.to_owned())),
        }
    }
}

/// One deferred unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: i64,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: i64,
    #[sqlx(rename = "type")]
    pub job_type: String,
    pub status: String,
    pub payload: Json<serde_json::Value>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            job_type: row.job_type,
            status: row.status.parse()?,
            payload: row.payload.0,
            attempts: row.attempts,
            last_error: row.last_error,
            available_at: row.available_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobCreate {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Delay in seconds
    pub delay: Option<i64>,
}

/// Cuts `message` down to [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => message[..idx].to_owned(),
        None => message.to_owned(),
    }
}

#[tokio::test]
async fn job_status_from_str() -> anyhow::Result<()> {
    // arrange
    let s = "processing";
    // act
    let status: JobStatus = s.parse()?;

    // assert
    assert_eq!(JobStatus::Processing, status);
    assert_eq!(s, status.to_string());
    Ok(())
}

#[tokio::test]
async fn job_status_from_str_err() -> anyhow::Result<()> {
    // arrange
    let s = "running";
    // act
    let status: Result<JobStatus, _> = s.parse();

    // assert
    assert!(matches!(status, Err(Error::UnknownStatus(ref v)) if v == "running"));
    Ok(())
}

#[tokio::test]
async fn truncate_error_counts_chars() -> anyhow::Result<()> {
    // arrange
    let long = "é".repeat(MAX_ERROR_LEN + 5);
    // act
    let cut = truncate_error(&long);

    // assert
    assert_eq!(MAX_ERROR_LEN, cut.chars().count());
    assert_eq!("boom", truncate_error("boom"));
    Ok(())
}

#[tokio::test]
async fn job_create_from_json() -> anyhow::Result<()> {
    // arrange
    let s = r#"{"type":"send_email","payload":{"to":"a@b.com"},"delay":30}"#;
    // act
    let create: JobCreate = serde_json::from_str(s)?;

    // assert
    assert_eq!("send_email", create.job_type);
    assert_eq!(serde_json::json!({"to": "a@b.com"}), create.payload);
    assert_eq!(Some(30), create.delay);
    Ok(())
}
