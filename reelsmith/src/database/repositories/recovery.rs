//! Retry history and batch item repositories.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::WritePool;
use crate::database::models::{BatchItemDbModel, RetryRecordDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::domain::{BatchItem, BatchItemStatus, NewRetryRecord, RetryRecord};

#[async_trait]
pub trait RetryRecordRepository: Send + Sync {
    /// Insert a record; `attempt_number` is the next one for its `error_id`.
    async fn record(&self, record: &NewRetryRecord) -> Result<RetryRecord>;
    async fn list_for_job(&self, job_id: &str) -> Result<Vec<RetryRecord>>;
    async fn list_for_error(&self, error_id: &str) -> Result<Vec<RetryRecord>>;
}

pub struct SqlxRetryRecordRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxRetryRecordRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl RetryRecordRepository for SqlxRetryRecordRepository {
    async fn record(&self, record: &NewRetryRecord) -> Result<RetryRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let row = retry_on_sqlite_busy("record_retry", || async {
            Ok(sqlx::query_as::<_, RetryRecordDbModel>(
                r#"
                INSERT INTO retry_record (id, error_id, job_id, attempt_number, strategy, result, error, created_at)
                VALUES (
                    ?, ?, ?,
                    (SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM retry_record WHERE error_id = ?),
                    ?, ?, ?, ?
                )
                RETURNING *
                "#,
            )
            .bind(&id)
            .bind(&record.error_id)
            .bind(&record.job_id)
            .bind(&record.error_id)
            .bind(record.strategy.as_str())
            .bind(record.result.as_str())
            .bind(record.error.as_deref())
            .bind(now_ms())
            .fetch_one(&self.write_pool)
            .await?)
        })
        .await?;

        RetryRecord::try_from(row)
    }

    async fn list_for_job(&self, job_id: &str) -> Result<Vec<RetryRecord>> {
        let rows = sqlx::query_as::<_, RetryRecordDbModel>(
            "SELECT * FROM retry_record WHERE job_id = ? ORDER BY created_at, attempt_number",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RetryRecord::try_from).collect()
    }

    async fn list_for_error(&self, error_id: &str) -> Result<Vec<RetryRecord>> {
        let rows = sqlx::query_as::<_, RetryRecordDbModel>(
            "SELECT * FROM retry_record WHERE error_id = ? ORDER BY attempt_number",
        )
        .bind(error_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RetryRecord::try_from).collect()
    }
}

#[async_trait]
pub trait BatchItemRepository: Send + Sync {
    /// Insert or overwrite the outcome of one item.
    async fn record_item(
        &self,
        job_id: &str,
        item_index: u32,
        item: &str,
        status: BatchItemStatus,
        error: Option<&str>,
    ) -> Result<()>;
    async fn list_items(&self, job_id: &str) -> Result<Vec<BatchItem>>;
}

pub struct SqlxBatchItemRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxBatchItemRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl BatchItemRepository for SqlxBatchItemRepository {
    async fn record_item(
        &self,
        job_id: &str,
        item_index: u32,
        item: &str,
        status: BatchItemStatus,
        error: Option<&str>,
    ) -> Result<()> {
        retry_on_sqlite_busy("record_batch_item", || async {
            sqlx::query(
                r#"
                INSERT INTO batch_item (job_id, item_index, item, status, error, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (job_id, item_index) DO UPDATE SET
                    item = excluded.item,
                    status = excluded.status,
                    error = excluded.error,
                    created_at = excluded.created_at
                "#,
            )
            .bind(job_id)
            .bind(i64::from(item_index))
            .bind(item)
            .bind(status.as_str())
            .bind(error)
            .bind(now_ms())
            .execute(&self.write_pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_items(&self, job_id: &str) -> Result<Vec<BatchItem>> {
        let rows = sqlx::query_as::<_, BatchItemDbModel>(
            "SELECT * FROM batch_item WHERE job_id = ? ORDER BY item_index",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BatchItem::try_from).collect()
    }
}
