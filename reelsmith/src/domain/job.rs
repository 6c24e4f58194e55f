//! Job entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a job produces.
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
    strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Only the AI-written script.
    ScriptOnly,
    /// Script, rendered video, upload and publish.
    FullVideo,
    /// Re-render an existing script as a short and upload it.
    ShortsConversion,
    /// Batch image crawl.
    Crawl,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

/// Job status values.
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
    strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    /// Waiting for its next stage to be picked up (also between retries).
    Pending,
    /// A stage worker is running.
    Processing,
    /// Last stage finished and its artifact was verified.
    Completed,
    /// Permanent failure; needs manual intervention.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
    /// Retries exhausted.
    Abandoned,
}

impl JobStatus {
    /// Statuses a job can be worked on from.
    pub const ACTIVE: &'static [JobStatus] = &[JobStatus::Pending, JobStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Abandoned
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    /// Only failed and abandoned jobs keep an error summary.
    pub fn carries_error(&self) -> bool {
        matches!(self, Self::Failed | Self::Abandoned)
    }
}

/// One operator-requested unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub title: String,
    pub kind: JobKind,
    pub owner_id: String,
    pub payload: Value,
    pub status: JobStatus,
    pub progress: u8,
    pub step: String,
    pub artifact_ref: Option<String>,
    pub error: Option<String>,
    pub completion_note: Option<String>,
    pub retry_count: u32,
    /// Claim order across jobs; higher first, ties by age.
    pub priority: i32,
    /// Incremented by every write; the cache never replaces a newer version.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub title: String,
    pub kind: JobKind,
    pub owner_id: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default)]
    pub priority: i32,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Per-field update of a job. `None` fields are left untouched.
///
/// Setting a status that does not carry an error clears `error`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub step: Option<String>,
    pub artifact_ref: Option<String>,
    pub error: Option<String>,
    pub completion_note: Option<String>,
    pub retry_count: Option<u32>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_artifact(mut self, artifact_ref: impl Into<String>) -> Self {
        self.artifact_ref = Some(artifact_ref.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_completion_note(mut self, note: impl Into<String>) -> Self {
        self.completion_note = Some(note.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Whether applying this patch must clear the stored error.
    pub fn clears_error(&self) -> bool {
        self.status.is_some_and(|s| !s.carries_error())
    }
}
