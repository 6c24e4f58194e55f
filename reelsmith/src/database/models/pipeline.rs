//! Pipeline and stage rows.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;
use crate::domain::{Stage, StageKind, StageStatus};
use crate::{Error, Result};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PipelineDbModel {
    pub id: String,
    pub job_id: String,
    pub schedule_id: Option<String>,
    pub created_at: i64,
}

/// Stage database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StageDbModel {
    pub id: String,
    pub pipeline_id: String,
    pub job_id: String,
    pub position: i64,
    /// script, video, upload, publish, crawl
    pub kind: String,
    /// pending, running, completed, failed
    pub status: String,
    pub ready_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub retry_count: i64,
    pub error: Option<String>,
    pub artifact_ref: Option<String>,
}

impl TryFrom<StageDbModel> for Stage {
    type Error = Error;

    fn try_from(row: StageDbModel) -> Result<Self> {
        let kind = StageKind::parse(&row.kind)
            .ok_or_else(|| Error::Database(format!("unknown stage kind '{}'", row.kind)))?;
        let status = StageStatus::parse(&row.status)
            .ok_or_else(|| Error::Database(format!("unknown stage status '{}'", row.status)))?;
        Ok(Stage {
            id: row.id,
            pipeline_id: row.pipeline_id,
            job_id: row.job_id,
            position: row.position.max(0) as u32,
            kind,
            status,
            ready_at: ms_to_datetime(row.ready_at),
            started_at: row.started_at.map(ms_to_datetime),
            completed_at: row.completed_at.map(ms_to_datetime),
            retry_count: row.retry_count.max(0) as u32,
            error: row.error,
            artifact_ref: row.artifact_ref,
        })
    }
}
