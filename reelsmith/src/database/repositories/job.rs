//! Job repository: jobs, their pipelines at creation time, and job logs.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{JobDbModel, JobLogDbModel, PipelineDbModel, StageDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{ms_to_datetime, now_ms};
use crate::database::{WritePool, begin_immediate};
use crate::domain::{
    Job, JobKind, JobPatch, JobStatus, LogEntry, NewJob, NewLogEntry, Pipeline, Stage, StageKind,
};
use crate::utils::json::{self, JsonContext};
use crate::{Error, Result};

/// Count of jobs per kind and status.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct JobCount {
    pub kind: JobKind,
    pub status: JobStatus,
    pub count: i64,
}

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a job, its pipeline and its stages in one transaction.
    async fn create_job(
        &self,
        job: &NewJob,
        plan: &[StageKind],
        schedule_id: Option<&str>,
        first_ready_at: i64,
    ) -> Result<(Job, Pipeline)>;
    async fn get_job(&self, id: &str) -> Result<Option<Job>>;
    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>>;
    async fn count_jobs(&self) -> Result<Vec<JobCount>>;
    /// Per-field merge; fails with `NotFound` for unknown ids.
    async fn update_job(&self, id: &str, patch: &JobPatch) -> Result<Job>;
    /// Compare-and-set on status. `None` when the job is not in `expected`.
    async fn transition_job(
        &self,
        id: &str,
        expected: &[JobStatus],
        patch: &JobPatch,
    ) -> Result<Option<Job>>;
    /// `progress = MAX(progress, floor)` for active jobs.
    async fn advance_progress(&self, id: &str, floor: u8, step: &str) -> Result<Option<Job>>;
    async fn append_log(&self, id: &str, entry: &NewLogEntry) -> Result<LogEntry>;
    async fn list_logs(&self, id: &str) -> Result<Vec<LogEntry>>;
    /// Delete terminal jobs last updated before `cutoff_ms`. Returns their ids.
    async fn purge_terminal_before(&self, cutoff_ms: i64) -> Result<Vec<String>>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

fn into_jobs(rows: Vec<JobDbModel>) -> Result<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

fn status_placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(
        &self,
        job: &NewJob,
        plan: &[StageKind],
        schedule_id: Option<&str>,
        first_ready_at: i64,
    ) -> Result<(Job, Pipeline)> {
        if plan.is_empty() {
            return Err(Error::validation("a pipeline needs at least one stage"));
        }
        let job_id = uuid::Uuid::new_v4().to_string();
        let pipeline_id = uuid::Uuid::new_v4().to_string();
        let payload = json::to_string_or_fallback(
            &job.payload,
            "{}",
            JsonContext::JobField {
                job_id: &job_id,
                field: "payload",
            },
            "Failed to serialize job payload",
        );

        retry_on_sqlite_busy("create_job", || async {
            let now = now_ms();
            let mut tx = begin_immediate(&self.write_pool).await?;

            let job_row = sqlx::query_as::<_, JobDbModel>(
                r#"
                INSERT INTO job (id, title, kind, owner_id, payload, status, progress, step,
                                 retry_count, priority, version, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, 'pending', 0, 'queued', 0, ?, 1, ?, ?)
                RETURNING *
                "#,
            )
            .bind(&job_id)
            .bind(&job.title)
            .bind(job.kind.as_str())
            .bind(&job.owner_id)
            .bind(&payload)
            .bind(job.priority)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            let pipeline_row = sqlx::query_as::<_, PipelineDbModel>(
                "INSERT INTO pipeline (id, job_id, schedule_id, created_at) VALUES (?, ?, ?, ?) RETURNING *",
            )
            .bind(&pipeline_id)
            .bind(&job_id)
            .bind(schedule_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            let mut stages = Vec::with_capacity(plan.len());
            for (position, kind) in plan.iter().enumerate() {
                let ready_at = if position == 0 { first_ready_at } else { now };
                let row = sqlx::query_as::<_, StageDbModel>(
                    r#"
                    INSERT INTO stage (id, pipeline_id, job_id, position, kind, status, ready_at, retry_count)
                    VALUES (?, ?, ?, ?, ?, 'pending', ?, 0)
                    RETURNING *
                    "#,
                )
                .bind(uuid::Uuid::new_v4().to_string())
                .bind(&pipeline_id)
                .bind(&job_id)
                .bind(position as i64)
                .bind(kind.as_str())
                .bind(ready_at)
                .fetch_one(&mut *tx)
                .await?;
                stages.push(Stage::try_from(row)?);
            }

            tx.commit().await?;

            let pipeline = Pipeline {
                id: pipeline_row.id,
                job_id: pipeline_row.job_id,
                schedule_id: pipeline_row.schedule_id,
                created_at: ms_to_datetime(pipeline_row.created_at),
                stages,
            };
            Ok((Job::try_from(job_row)?, pipeline))
        })
        .await
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, JobDbModel>(
                    "SELECT * FROM job WHERE status = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobDbModel>(
                    "SELECT * FROM job ORDER BY created_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        into_jobs(rows)
    }

    async fn count_jobs(&self) -> Result<Vec<JobCount>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT kind, status, COUNT(*) FROM job GROUP BY kind, status ORDER BY kind, status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(kind, status, count)| -> Result<JobCount> {
                Ok(JobCount {
                    kind: JobKind::parse(&kind)
                        .ok_or_else(|| Error::Database(format!("unknown job kind '{}'", kind)))?,
                    status: JobStatus::parse(&status).ok_or_else(|| {
                        Error::Database(format!("unknown job status '{}'", status))
                    })?,
                    count,
                })
            })
            .collect()
    }

    async fn update_job(&self, id: &str, patch: &JobPatch) -> Result<Job> {
        self.transition_job(id, &[], patch)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn transition_job(
        &self,
        id: &str,
        expected: &[JobStatus],
        patch: &JobPatch,
    ) -> Result<Option<Job>> {
        let guard = if expected.is_empty() {
            String::new()
        } else {
            format!(" AND status IN ({})", status_placeholders(expected.len()))
        };
        let sql = format!(
            r#"
            UPDATE job SET
                status = COALESCE(?, status),
                progress = COALESCE(?, progress),
                step = COALESCE(?, step),
                artifact_ref = COALESCE(?, artifact_ref),
                error = CASE WHEN ? THEN NULL ELSE COALESCE(?, error) END,
                completion_note = COALESCE(?, completion_note),
                retry_count = COALESCE(?, retry_count),
                version = version + 1,
                updated_at = ?
            WHERE id = ?{guard}
            RETURNING *
            "#
        );

        let row = retry_on_sqlite_busy("transition_job", || async {
            let mut query = sqlx::query_as::<_, JobDbModel>(&sql)
                .bind(patch.status.map(|s| s.as_str()))
                .bind(patch.progress.map(i64::from))
                .bind(patch.step.as_deref())
                .bind(patch.artifact_ref.as_deref())
                .bind(patch.clears_error())
                .bind(patch.error.as_deref())
                .bind(patch.completion_note.as_deref())
                .bind(patch.retry_count.map(i64::from))
                .bind(now_ms())
                .bind(id);
            for status in expected {
                query = query.bind(status.as_str());
            }
            Ok(query.fetch_optional(&self.write_pool).await?)
        })
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn advance_progress(&self, id: &str, floor: u8, step: &str) -> Result<Option<Job>> {
        let floor = i64::from(floor.min(100));
        let row = retry_on_sqlite_busy("advance_progress", || async {
            Ok(sqlx::query_as::<_, JobDbModel>(
                r#"
                UPDATE job SET
                    step = CASE WHEN ? >= progress THEN ? ELSE step END,
                    progress = MAX(progress, ?),
                    version = version + 1,
                    updated_at = ?
                WHERE id = ? AND status IN ('pending', 'processing')
                RETURNING *
                "#,
            )
            .bind(floor)
            .bind(step)
            .bind(floor)
            .bind(now_ms())
            .bind(id)
            .fetch_optional(&self.write_pool)
            .await?)
        })
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn append_log(&self, id: &str, entry: &NewLogEntry) -> Result<LogEntry> {
        let row = retry_on_sqlite_busy("append_log", || async {
            Ok(sqlx::query_as::<_, JobLogDbModel>(
                r#"
                INSERT INTO job_log (job_id, sequence, timestamp, message, level, stream)
                VALUES (?, (SELECT COALESCE(MAX(sequence), 0) + 1 FROM job_log WHERE job_id = ?), ?, ?, ?, ?)
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(id)
            .bind(now_ms())
            .bind(&entry.message)
            .bind(entry.level.as_str())
            .bind(entry.stream.as_str())
            .fetch_one(&self.write_pool)
            .await?)
        })
        .await?;

        LogEntry::try_from(row)
    }

    async fn list_logs(&self, id: &str) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, JobLogDbModel>(
            "SELECT * FROM job_log WHERE job_id = ? ORDER BY sequence",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LogEntry::try_from).collect()
    }

    async fn purge_terminal_before(&self, cutoff_ms: i64) -> Result<Vec<String>> {
        retry_on_sqlite_busy("purge_terminal_before", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;

            let ids: Vec<(String,)> = sqlx::query_as(
                r#"
                SELECT id FROM job
                WHERE status IN ('completed', 'failed', 'cancelled', 'abandoned')
                  AND updated_at < ?
                "#,
            )
            .bind(cutoff_ms)
            .fetch_all(&mut *tx)
            .await?;

            for (id,) in &ids {
                // Pipelines go first; stages cascade from them.
                sqlx::query("DELETE FROM pipeline WHERE job_id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM job WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok(ids.into_iter().map(|(id,)| id).collect())
        })
        .await
    }
}
