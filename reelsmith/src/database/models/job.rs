//! Job and job log rows.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;
use crate::domain::{Job, JobKind, JobStatus, LogEntry, LogLevel, LogStream};
use crate::utils::json::{self, JsonContext};
use crate::{Error, Result};

/// Job database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub title: String,
    /// script-only, full-video, shorts-conversion, crawl
    pub kind: String,
    pub owner_id: String,
    /// JSON object handed to workers
    pub payload: String,
    /// pending, processing, completed, failed, cancelled, abandoned
    pub status: String,
    pub progress: i64,
    pub step: String,
    pub artifact_ref: Option<String>,
    pub error: Option<String>,
    pub completion_note: Option<String>,
    pub retry_count: i64,
    /// Higher runs first.
    pub priority: i64,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<JobDbModel> for Job {
    type Error = Error;

    fn try_from(row: JobDbModel) -> Result<Self> {
        let kind = JobKind::parse(&row.kind)
            .ok_or_else(|| Error::Database(format!("unknown job kind '{}'", row.kind)))?;
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| Error::Database(format!("unknown job status '{}'", row.status)))?;
        let payload = json::parse_object_or_empty(
            &row.payload,
            JsonContext::JobField {
                job_id: &row.id,
                field: "payload",
            },
            "Failed to parse job payload",
        );

        Ok(Job {
            kind,
            status,
            payload,
            progress: row.progress.clamp(0, 100) as u8,
            retry_count: row.retry_count.max(0) as u32,
            priority: row.priority.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32,
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
            id: row.id,
            title: row.title,
            owner_id: row.owner_id,
            step: row.step,
            artifact_ref: row.artifact_ref,
            error: row.error,
            completion_note: row.completion_note,
            version: row.version,
        })
    }
}

/// Job log database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobLogDbModel {
    pub id: i64,
    pub job_id: String,
    pub sequence: i64,
    pub timestamp: i64,
    pub message: String,
    pub level: String,
    pub stream: String,
}

impl TryFrom<JobLogDbModel> for LogEntry {
    type Error = Error;

    fn try_from(row: JobLogDbModel) -> Result<Self> {
        let level = LogLevel::parse(&row.level)
            .ok_or_else(|| Error::Database(format!("unknown log level '{}'", row.level)))?;
        let stream = LogStream::parse(&row.stream)
            .ok_or_else(|| Error::Database(format!("unknown log stream '{}'", row.stream)))?;
        Ok(LogEntry {
            job_id: row.job_id,
            sequence: row.sequence,
            timestamp: ms_to_datetime(row.timestamp),
            message: row.message,
            level,
            stream,
        })
    }
}
