//! Pipeline / stage repository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::{PipelineDbModel, StageDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{datetime_to_ms, ms_to_datetime, now_ms};
use crate::database::{WritePool, begin_immediate};
use crate::domain::{Pipeline, Stage, StageKind, StageStatus};
use crate::Result;

/// Field changes applied together with a stage status transition.
///
/// Timestamps, `error` and `artifact_ref` follow the target status:
/// `running` stamps `started_at` and clears the error, `completed`/`failed`
/// stamp `completed_at`, only `completed` keeps an artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageChange {
    pub error: Option<String>,
    pub artifact_ref: Option<String>,
    pub retry_count: Option<u32>,
    pub ready_at: Option<DateTime<Utc>>,
}

/// Pipeline repository trait.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    async fn get_pipeline_for_job(&self, job_id: &str) -> Result<Option<Pipeline>>;
    async fn get_stage(&self, id: &str) -> Result<Option<Stage>>;
    /// Atomically move up to `limit` ready stages from `pending` to `running`.
    ///
    /// A stage is ready when its `ready_at` has passed, every earlier stage of
    /// its pipeline is completed, no sibling is running and its job is active.
    /// Stages are claimed by job priority (highest first), then job age.
    async fn claim_ready(&self, limit: i64) -> Result<Vec<Stage>> {
        self.claim_ready_within(limit, &HashMap::new()).await
    }
    /// [`claim_ready`](Self::claim_ready) that also skips a stage when
    /// `kind_limits` caps its kind and that many are already running.
    async fn claim_ready_within(
        &self,
        limit: i64,
        kind_limits: &HashMap<StageKind, usize>,
    ) -> Result<Vec<Stage>>;
    /// How many ready stages of the same kind would be claimed before the
    /// job's waiting stage. `None` when the job has no waiting stage.
    async fn queue_position(&self, job_id: &str) -> Result<Option<i64>>;
    /// Guarded transition: applies only if the row is still in `stage.status`.
    async fn transition_stage(
        &self,
        stage: &Stage,
        to: StageStatus,
        change: &StageChange,
    ) -> Result<Option<Stage>>;
    async fn list_stages_by_status(&self, status: StageStatus) -> Result<Vec<Stage>>;
    /// Running stages started before `started_before_ms`.
    async fn list_stuck_stages(&self, started_before_ms: i64) -> Result<Vec<Stage>>;
    /// Earliest `ready_at` among pending stages, used to size the poller's sleep.
    async fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>>;
}

/// Conditions on `stage s` / `job j` for a stage that is next in line: its job
/// is active, every earlier stage is completed and no sibling is running.
const WAITING: &str = r#"j.status IN ('pending', 'processing')
                  AND NOT EXISTS (
                      SELECT 1 FROM stage p
                      WHERE p.pipeline_id = s.pipeline_id
                        AND p.position < s.position
                        AND p.status != 'completed'
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM stage r
                      WHERE r.pipeline_id = s.pipeline_id AND r.status = 'running'
                  )"#;

/// SQLx implementation of PipelineRepository.
pub struct SqlxPipelineRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxPipelineRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

fn into_stages(rows: Vec<StageDbModel>) -> Result<Vec<Stage>> {
    rows.into_iter().map(Stage::try_from).collect()
}

#[async_trait]
impl PipelineRepository for SqlxPipelineRepository {
    async fn get_pipeline_for_job(&self, job_id: &str) -> Result<Option<Pipeline>> {
        let Some(row) =
            sqlx::query_as::<_, PipelineDbModel>("SELECT * FROM pipeline WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?
        else {
            return Ok(None);
        };

        let stages = sqlx::query_as::<_, StageDbModel>(
            "SELECT * FROM stage WHERE pipeline_id = ? ORDER BY position",
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Pipeline {
            id: row.id,
            job_id: row.job_id,
            schedule_id: row.schedule_id,
            created_at: ms_to_datetime(row.created_at),
            stages: into_stages(stages)?,
        }))
    }

    async fn get_stage(&self, id: &str) -> Result<Option<Stage>> {
        sqlx::query_as::<_, StageDbModel>("SELECT * FROM stage WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Stage::try_from)
            .transpose()
    }

    async fn claim_ready_within(
        &self,
        limit: i64,
        kind_limits: &HashMap<StageKind, usize>,
    ) -> Result<Vec<Stage>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        retry_on_sqlite_busy("claim_ready", || async {
            let now = now_ms();
            let mut tx = begin_immediate(&self.write_pool).await?;

            let mut running: HashMap<StageKind, usize> = HashMap::new();
            if !kind_limits.is_empty() {
                let rows: Vec<(String, i64)> = sqlx::query_as(
                    "SELECT kind, COUNT(*) FROM stage WHERE status = 'running' GROUP BY kind",
                )
                .fetch_all(&mut *tx)
                .await?;
                for (kind, count) in rows {
                    if let Some(kind) = StageKind::parse(&kind) {
                        running.insert(kind, count.max(0) as usize);
                    }
                }
            }

            // With kind limits some candidates may be skipped, so fetch them all.
            let candidate_limit = if kind_limits.is_empty() { limit } else { -1 };
            let sql = format!(
                r#"
                SELECT s.id, s.kind FROM stage s
                JOIN job j ON j.id = s.job_id
                WHERE s.status = 'pending'
                  AND s.ready_at <= ?
                  AND {WAITING}
                ORDER BY j.priority DESC, j.created_at, j.id
                LIMIT ?
                "#
            );
            let candidates: Vec<(String, String)> = sqlx::query_as(&sql)
                .bind(now)
                .bind(candidate_limit)
                .fetch_all(&mut *tx)
                .await?;

            let mut claimed = Vec::with_capacity(candidates.len().min(limit as usize));
            for (id, kind) in candidates {
                if claimed.len() as i64 >= limit {
                    break;
                }
                let kind = StageKind::parse(&kind);
                if let Some(kind) = kind
                    && let Some(&max) = kind_limits.get(&kind)
                    && running.get(&kind).copied().unwrap_or(0) >= max
                {
                    continue;
                }

                let row = sqlx::query_as::<_, StageDbModel>(
                    r#"
                    UPDATE stage SET
                        status = 'running',
                        started_at = ?,
                        completed_at = NULL,
                        error = NULL,
                        artifact_ref = NULL
                    WHERE id = ? AND status = 'pending'
                    RETURNING *
                    "#,
                )
                .bind(now)
                .bind(&id)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(row) = row {
                    if let Some(kind) = kind {
                        *running.entry(kind).or_default() += 1;
                    }
                    claimed.push(Stage::try_from(row)?);
                }
            }

            tx.commit().await?;
            Ok(claimed)
        })
        .await
    }

    async fn transition_stage(
        &self,
        stage: &Stage,
        to: StageStatus,
        change: &StageChange,
    ) -> Result<Option<Stage>> {
        let now = now_ms();
        let started_at = match to {
            StageStatus::Running => Some(now),
            _ => stage.started_at.map(datetime_to_ms),
        };
        let completed_at = match to {
            StageStatus::Completed | StageStatus::Failed => Some(now),
            StageStatus::Pending | StageStatus::Running => None,
        };
        let error = match to {
            StageStatus::Failed | StageStatus::Pending => {
                change.error.clone().or_else(|| stage.error.clone())
            }
            StageStatus::Running | StageStatus::Completed => None,
        };
        let artifact_ref = match to {
            StageStatus::Completed => change.artifact_ref.clone(),
            _ => None,
        };
        let retry_count = i64::from(change.retry_count.unwrap_or(stage.retry_count));
        let ready_at = datetime_to_ms(change.ready_at.unwrap_or(stage.ready_at));

        let row = retry_on_sqlite_busy("transition_stage", || async {
            Ok(sqlx::query_as::<_, StageDbModel>(
                r#"
                UPDATE stage SET
                    status = ?,
                    started_at = ?,
                    completed_at = ?,
                    error = ?,
                    artifact_ref = ?,
                    retry_count = ?,
                    ready_at = ?
                WHERE id = ? AND status = ?
                RETURNING *
                "#,
            )
            .bind(to.as_str())
            .bind(started_at)
            .bind(completed_at)
            .bind(error.as_deref())
            .bind(artifact_ref.as_deref())
            .bind(retry_count)
            .bind(ready_at)
            .bind(&stage.id)
            .bind(stage.status.as_str())
            .fetch_optional(&self.write_pool)
            .await?)
        })
        .await?;

        row.map(Stage::try_from).transpose()
    }

    async fn queue_position(&self, job_id: &str) -> Result<Option<i64>> {
        let sql = format!(
            r#"
            SELECT s.kind, j.priority, j.created_at FROM stage s
            JOIN job j ON j.id = s.job_id
            WHERE s.job_id = ? AND s.status = 'pending' AND {WAITING}
            ORDER BY s.position
            LIMIT 1
            "#
        );
        let waiting: Option<(String, i64, i64)> = sqlx::query_as(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some((kind, priority, created_at)) = waiting else {
            return Ok(None);
        };

        let sql = format!(
            r#"
            SELECT COUNT(*) FROM stage s
            JOIN job j ON j.id = s.job_id
            WHERE s.kind = ?
              AND s.status = 'pending'
              AND s.ready_at <= ?
              AND j.id != ?
              AND {WAITING}
              AND (j.priority > ?
                   OR (j.priority = ? AND (j.created_at < ? OR (j.created_at = ? AND j.id < ?))))
            "#
        );
        let (ahead,): (i64,) = sqlx::query_as(&sql)
            .bind(&kind)
            .bind(now_ms())
            .bind(job_id)
            .bind(priority)
            .bind(priority)
            .bind(created_at)
            .bind(created_at)
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(Some(ahead))
    }

    async fn list_stages_by_status(&self, status: StageStatus) -> Result<Vec<Stage>> {
        let rows = sqlx::query_as::<_, StageDbModel>(
            "SELECT * FROM stage WHERE status = ? ORDER BY ready_at, position",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        into_stages(rows)
    }

    async fn list_stuck_stages(&self, started_before_ms: i64) -> Result<Vec<Stage>> {
        let rows = sqlx::query_as::<_, StageDbModel>(
            "SELECT * FROM stage WHERE status = 'running' AND started_at < ? ORDER BY started_at",
        )
        .bind(started_before_ms)
        .fetch_all(&self.pool)
        .await?;
        into_stages(rows)
    }

    async fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MIN(ready_at) FROM stage WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0.map(ms_to_datetime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::domain::{JobKind, NewJob};
    use crate::store::JobStore;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, JobStore) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("claim.db").display());
        let db = Database::connect(&url).await.unwrap();
        (dir, JobStore::new(&db))
    }

    async fn submit(store: &JobStore, kind: JobKind, priority: i32) -> String {
        let (job, _) = store
            .create_job(
                &NewJob {
                    title: format!("p{priority}"),
                    kind,
                    owner_id: "o".to_string(),
                    payload: serde_json::json!({}),
                    priority,
                },
                None,
                None,
            )
            .await
            .unwrap();
        // Distinct created_at values keep the age tie-break deterministic.
        tokio::time::sleep(Duration::from_millis(3)).await;
        job.id
    }

    #[tokio::test]
    async fn claims_highest_priority_then_oldest() {
        let (_dir, store) = setup().await;
        let low = submit(&store, JobKind::ScriptOnly, 0).await;
        let high = submit(&store, JobKind::ScriptOnly, 5).await;
        let older_mid = submit(&store, JobKind::ScriptOnly, 1).await;
        let newer_mid = submit(&store, JobKind::ScriptOnly, 1).await;

        let mut order = Vec::new();
        while let Some(stage) = store.pipelines().claim_ready(1).await.unwrap().pop() {
            order.push(stage.job_id);
        }
        assert_eq!(order, vec![high, older_mid, newer_mid, low]);
    }

    #[tokio::test]
    async fn kind_limit_caps_running_stages() {
        let (_dir, store) = setup().await;
        let first = submit(&store, JobKind::ShortsConversion, 0).await;
        let second = submit(&store, JobKind::ShortsConversion, 0).await;
        let script = submit(&store, JobKind::ScriptOnly, 0).await;
        let limits = HashMap::from([(StageKind::Video, 1)]);

        let claimed = store.pipelines().claim_ready_within(10, &limits).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|s| s.job_id.clone()).collect();
        assert_eq!(ids, vec![first.clone(), script]);
        assert!(store.pipelines().claim_ready_within(10, &limits).await.unwrap().is_empty());

        // Finishing the render frees the video slot for the next job.
        let video = claimed.into_iter().find(|s| s.job_id == first).unwrap();
        store
            .pipelines()
            .transition_stage(&video, StageStatus::Completed, &StageChange::default())
            .await
            .unwrap()
            .unwrap();
        let claimed = store.pipelines().claim_ready_within(10, &limits).await.unwrap();
        let kinds: Vec<_> = claimed.iter().map(|s| (s.job_id.clone(), s.kind)).collect();
        assert_eq!(
            kinds,
            vec![(first, StageKind::Upload), (second, StageKind::Video)]
        );
    }

    #[tokio::test]
    async fn queue_position_counts_stages_ahead_of_the_same_kind() {
        let (_dir, store) = setup().await;
        let a = submit(&store, JobKind::ScriptOnly, 0).await;
        let b = submit(&store, JobKind::ScriptOnly, 0).await;
        let urgent = submit(&store, JobKind::ScriptOnly, 9).await;
        let crawl = submit(&store, JobKind::Crawl, 0).await;

        let repo = store.pipelines();
        assert_eq!(repo.queue_position(&urgent).await.unwrap(), Some(0));
        assert_eq!(repo.queue_position(&a).await.unwrap(), Some(1));
        assert_eq!(repo.queue_position(&b).await.unwrap(), Some(2));
        assert_eq!(repo.queue_position(&crawl).await.unwrap(), Some(0));

        // A running job is no longer waiting.
        let claimed = repo.claim_ready(1).await.unwrap();
        assert_eq!(claimed[0].job_id, urgent);
        assert_eq!(repo.queue_position(&urgent).await.unwrap(), None);
        assert_eq!(repo.queue_position(&a).await.unwrap(), Some(0));
        assert_eq!(repo.queue_position("missing").await.unwrap(), None);
    }
}
