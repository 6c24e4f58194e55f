//! Retry record and batch item rows.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;
use crate::domain::{
    BatchItem, BatchItemStatus, RetryRecord, RetryResult, RetryStrategy,
};
use crate::{Error, Result};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RetryRecordDbModel {
    pub id: String,
    /// Id of the failing stage.
    pub error_id: String,
    pub job_id: String,
    pub attempt_number: i64,
    pub strategy: String,
    pub result: String,
    pub error: Option<String>,
    pub created_at: i64,
}

impl TryFrom<RetryRecordDbModel> for RetryRecord {
    type Error = Error;

    fn try_from(row: RetryRecordDbModel) -> Result<Self> {
        let strategy = RetryStrategy::parse(&row.strategy).ok_or_else(|| {
            Error::Database(format!("unknown retry strategy '{}'", row.strategy))
        })?;
        let result = RetryResult::parse(&row.result)
            .ok_or_else(|| Error::Database(format!("unknown retry result '{}'", row.result)))?;
        Ok(RetryRecord {
            id: row.id,
            error_id: row.error_id,
            job_id: row.job_id,
            attempt_number: row.attempt_number.max(0) as u32,
            strategy,
            result,
            error: row.error,
            created_at: ms_to_datetime(row.created_at),
        })
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BatchItemDbModel {
    pub job_id: String,
    pub item_index: i64,
    pub item: String,
    pub status: String,
    pub error: Option<String>,
    pub created_at: i64,
}

impl TryFrom<BatchItemDbModel> for BatchItem {
    type Error = Error;

    fn try_from(row: BatchItemDbModel) -> Result<Self> {
        let status = BatchItemStatus::parse(&row.status)
            .ok_or_else(|| Error::Database(format!("unknown batch item status '{}'", row.status)))?;
        Ok(BatchItem {
            job_id: row.job_id,
            item_index: row.item_index.max(0) as u32,
            item: row.item,
            status,
            error: row.error,
            created_at: ms_to_datetime(row.created_at),
        })
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SettingDbModel {
    pub key: String,
    pub value: String,
    pub updated_at: i64,
}
