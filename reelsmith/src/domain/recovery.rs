//! Retry history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a failed attempt was (or will be) recovered.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum RetryStrategy {
    /// Automatic retry after a growing delay.
    ExponentialBackoff,
    /// Stage restarted after the orchestrator itself went away.
    RestartComponent,
    /// Stage inputs restored from an earlier artifact.
    RestoreFromBackup,
    /// Operator requeued the job.
    ManualFix,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum RetryResult {
    Success,
    Failed,
}

impl RetryResult {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

/// One attempt in the history of a failing stage.
///
/// `error_id` is the id of the stage that failed; `attempt_number` is
/// strictly increasing per `error_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub id: String,
    pub error_id: String,
    pub job_id: String,
    pub attempt_number: u32,
    pub strategy: RetryStrategy,
    pub result: RetryResult,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for recording an attempt; the attempt number is assigned on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRetryRecord {
    pub error_id: String,
    pub job_id: String,
    pub strategy: RetryStrategy,
    pub result: RetryResult,
    pub error: Option<String>,
}
