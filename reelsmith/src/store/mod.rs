//! Job store: durable job/pipeline/log state fronted by a read-through cache.
//!
//! SQLite is the source of truth. Every write commits first and only then
//! refreshes the cache with the row returned by the write; the cache never
//! replaces an entry with an older `version`. Readers that miss the cache
//! fall back to the database, so status stays readable after a restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::database::Database;
use crate::database::repositories::{
    BatchItemRepository, JobCount, JobRepository, PipelineRepository, RetryRecordRepository,
    SqlxBatchItemRepository, SqlxJobRepository, SqlxPipelineRepository,
    SqlxRetryRecordRepository,
};
use crate::database::time::{datetime_to_ms, now_ms};
use crate::domain::{
    Job, JobPatch, JobStatus, LogEntry, LogLevel, NewJob, NewLogEntry, Pipeline, StageKind,
};
use crate::{Error, Result};

pub struct JobStore {
    jobs: Arc<dyn JobRepository>,
    pipelines: Arc<dyn PipelineRepository>,
    retries: Arc<dyn RetryRecordRepository>,
    batches: Arc<dyn BatchItemRepository>,
    cache: DashMap<String, Job>,
}

impl JobStore {
    /// Build a store backed by the SQLx repositories.
    pub fn new(db: &Database) -> Self {
        Self::with_repositories(
            Arc::new(SqlxJobRepository::new(db.read.clone(), db.write.clone())),
            Arc::new(SqlxPipelineRepository::new(db.read.clone(), db.write.clone())),
            Arc::new(SqlxRetryRecordRepository::new(db.read.clone(), db.write.clone())),
            Arc::new(SqlxBatchItemRepository::new(db.read.clone(), db.write.clone())),
        )
    }

    pub fn with_repositories(
        jobs: Arc<dyn JobRepository>,
        pipelines: Arc<dyn PipelineRepository>,
        retries: Arc<dyn RetryRecordRepository>,
        batches: Arc<dyn BatchItemRepository>,
    ) -> Self {
        Self {
            jobs,
            pipelines,
            retries,
            batches,
            cache: DashMap::new(),
        }
    }

    pub fn pipelines(&self) -> &dyn PipelineRepository {
        self.pipelines.as_ref()
    }

    pub fn retries(&self) -> &dyn RetryRecordRepository {
        self.retries.as_ref()
    }

    pub fn batches(&self) -> &dyn BatchItemRepository {
        self.batches.as_ref()
    }

    /// Insert `job` unless the cache already holds a newer version.
    fn cache_put(&self, job: &Job) {
        match self.cache.entry(job.id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().version <= job.version {
                    entry.insert(job.clone());
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(job.clone());
            }
        }
    }

    fn evict(&self, id: &str) {
        self.cache.remove(id);
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Create a job with its pipeline; the first stage becomes ready at `run_at`.
    pub async fn create_job(
        &self,
        job: &NewJob,
        schedule_id: Option<&str>,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<(Job, Pipeline)> {
        let plan = StageKind::plan_for(job.kind);
        let first_ready_at = run_at.map(datetime_to_ms).unwrap_or_else(now_ms);
        let (job, pipeline) = self
            .jobs
            .create_job(job, plan, schedule_id, first_ready_at)
            .await?;
        self.cache_put(&job);
        debug!(job_id = %job.id, kind = %job.kind, stages = pipeline.stages.len(), "Job created");
        Ok((job, pipeline))
    }

    /// Read a job, serving from the cache when possible.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        if let Some(job) = self.cache.get(id) {
            return Ok(Some(job.clone()));
        }
        self.refresh_job(id).await
    }

    /// Read a job from the database, bypassing (and refreshing) the cache.
    pub async fn refresh_job(&self, id: &str) -> Result<Option<Job>> {
        let job = self.jobs.get_job(id).await?;
        if let Some(job) = &job {
            self.cache_put(job);
        }
        Ok(job)
    }

    pub async fn require_job(&self, id: &str) -> Result<Job> {
        self.get_job(id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    /// Per-field merge; `NotFound` for unknown ids.
    pub async fn update_job(&self, id: &str, patch: &JobPatch) -> Result<Job> {
        let job = self.jobs.update_job(id, patch).await?;
        self.cache_put(&job);
        Ok(job)
    }

    /// Apply `patch` only if the job's status is one of `expected`.
    pub async fn transition_job(
        &self,
        id: &str,
        expected: &[JobStatus],
        patch: &JobPatch,
    ) -> Result<Option<Job>> {
        let job = self.jobs.transition_job(id, expected, patch).await?;
        match &job {
            Some(job) => self.cache_put(job),
            None => debug!(job_id = %id, ?expected, to = ?patch.status, "Job transition skipped"),
        }
        Ok(job)
    }

    /// Raise progress to at least `floor`; never lowers it.
    pub async fn advance_progress(&self, id: &str, floor: u8, step: &str) -> Result<Option<Job>> {
        let job = self.jobs.advance_progress(id, floor, step).await?;
        if let Some(job) = &job {
            self.cache_put(job);
        }
        Ok(job)
    }

    pub async fn append_log(&self, id: &str, entry: &NewLogEntry) -> Result<LogEntry> {
        self.jobs.append_log(id, entry).await
    }

    /// Append a system log entry, logging (not propagating) failures.
    pub async fn log_system(&self, id: &str, level: LogLevel, message: impl Into<String>) {
        let entry = NewLogEntry::system(level, message);
        if let Err(e) = self.jobs.append_log(id, &entry).await {
            warn!(job_id = %id, error = %e, "Failed to append job log");
        }
    }

    pub async fn list_logs(&self, id: &str) -> Result<Vec<LogEntry>> {
        self.jobs.list_logs(id).await
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        self.jobs.list_jobs(status, limit).await
    }

    pub async fn count_jobs(&self) -> Result<Vec<JobCount>> {
        self.jobs.count_jobs().await
    }

    pub async fn get_pipeline(&self, job_id: &str) -> Result<Pipeline> {
        self.pipelines
            .get_pipeline_for_job(job_id)
            .await?
            .ok_or_else(|| Error::not_found("Pipeline", job_id))
    }

    /// Delete terminal jobs not updated since `cutoff`.
    pub async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let ids = self
            .jobs
            .purge_terminal_before(datetime_to_ms(cutoff))
            .await?;
        for id in &ids {
            self.evict(id);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobKind, LogStream};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, JobStore) {
        let temp_dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", temp_dir.path().join("store.db").display());
        let db = Database::connect(&url).await.unwrap();
        (temp_dir, JobStore::new(&db))
    }

    fn new_job(kind: JobKind) -> NewJob {
        NewJob {
            title: "Deep sea creatures".to_string(),
            kind,
            owner_id: "owner-1".to_string(),
            payload: serde_json::json!({"topic": "ocean"}),
            priority: 0,
        }
    }

    #[tokio::test]
    async fn create_job_builds_pipeline() {
        let (_dir, store) = setup().await;
        let (job, pipeline) = store
            .create_job(&new_job(JobKind::FullVideo), Some("schedule-9"), None)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.payload["topic"], "ocean");
        assert_eq!(pipeline.schedule_id.as_deref(), Some("schedule-9"));
        let kinds: Vec<StageKind> = pipeline.stages.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::Script,
                StageKind::Video,
                StageKind::Upload,
                StageKind::Publish
            ]
        );

        let loaded = store.get_pipeline(&job.id).await.unwrap();
        assert_eq!(loaded.stages.len(), 4);
    }

    #[tokio::test]
    async fn update_unknown_job_is_not_found() {
        let (_dir, store) = setup().await;
        let err = store
            .update_job("missing", &JobPatch::default().with_step("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let (_dir, store) = setup().await;
        let (job, _) = store
            .create_job(&new_job(JobKind::ScriptOnly), None, None)
            .await
            .unwrap();

        store
            .update_job(&job.id, &JobPatch::default().with_step("writing"))
            .await
            .unwrap();
        let updated = store
            .update_job(&job.id, &JobPatch::default().with_progress(30))
            .await
            .unwrap();

        assert_eq!(updated.step, "writing");
        assert_eq!(updated.progress, 30);
        assert!(updated.version > job.version);
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let (_dir, store) = setup().await;
        let (job, _) = store
            .create_job(&new_job(JobKind::ScriptOnly), None, None)
            .await
            .unwrap();

        store.advance_progress(&job.id, 60, "voice synthesis").await.unwrap();
        let after = store
            .advance_progress(&job.id, 45, "media download")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.progress, 60);
        assert_eq!(after.step, "voice synthesis");
    }

    #[tokio::test]
    async fn guarded_transition_respects_terminal_state() {
        let (_dir, store) = setup().await;
        let (job, _) = store
            .create_job(&new_job(JobKind::ScriptOnly), None, None)
            .await
            .unwrap();

        store
            .transition_job(
                &job.id,
                &[JobStatus::Pending],
                &JobPatch::status(JobStatus::Cancelled),
            )
            .await
            .unwrap()
            .unwrap();
        let late = store
            .transition_job(
                &job.id,
                &[JobStatus::Pending, JobStatus::Processing],
                &JobPatch::status(JobStatus::Processing),
            )
            .await
            .unwrap();
        assert!(late.is_none());
        assert_eq!(
            store.require_job(&job.id).await.unwrap().status,
            JobStatus::Cancelled
        );
        // No progress updates once terminal.
        assert!(store.advance_progress(&job.id, 80, "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_cleared_when_job_leaves_failure() {
        let (_dir, store) = setup().await;
        let (job, _) = store
            .create_job(&new_job(JobKind::ScriptOnly), None, None)
            .await
            .unwrap();

        let failed = store
            .update_job(
                &job.id,
                &JobPatch::status(JobStatus::Failed).with_error("boom"),
            )
            .await
            .unwrap();
        assert_eq!(failed.error.as_deref(), Some("boom"));

        let pending = store
            .update_job(&job.id, &JobPatch::status(JobStatus::Pending))
            .await
            .unwrap();
        assert!(pending.error.is_none());
    }

    #[tokio::test]
    async fn concurrent_appends_get_unique_increasing_sequences() {
        let (_dir, store) = setup().await;
        let store = Arc::new(store);
        let (job, _) = store
            .create_job(&new_job(JobKind::Crawl), None, None)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let job_id = job.id.clone();
            handles.push(tokio::spawn(async move {
                let stream = if i % 2 == 0 {
                    LogStream::Stdout
                } else {
                    LogStream::Stderr
                };
                store
                    .append_log(&job_id, &NewLogEntry::new(LogLevel::Info, stream, format!("line {i}")))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let logs = store.list_logs(&job.id).await.unwrap();
        assert_eq!(logs.len(), 20);
        for pair in logs.windows(2) {
            assert!(pair[0].sequence < pair[1].sequence);
        }
        assert_eq!(logs.first().unwrap().sequence, 1);
        assert_eq!(logs.last().unwrap().sequence, 20);
    }

    #[tokio::test]
    async fn cache_miss_falls_back_to_database() {
        let temp_dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", temp_dir.path().join("restart.db").display());
        let db = Database::connect(&url).await.unwrap();

        let job_id = {
            let store = JobStore::new(&db);
            let (job, _) = store
                .create_job(&new_job(JobKind::ScriptOnly), None, None)
                .await
                .unwrap();
            store
                .advance_progress(&job.id, 45, "media download")
                .await
                .unwrap();
            job.id
        };

        // A fresh store has an empty cache, as after a restart.
        let store = JobStore::new(&db);
        assert_eq!(store.cached_len(), 0);
        let job = store.require_job(&job_id).await.unwrap();
        assert_eq!(job.progress, 45);
        assert_eq!(store.cached_len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_terminal_jobs_only() {
        let (_dir, store) = setup().await;
        let (done, _) = store
            .create_job(&new_job(JobKind::ScriptOnly), None, None)
            .await
            .unwrap();
        let (active, _) = store
            .create_job(&new_job(JobKind::ScriptOnly), None, None)
            .await
            .unwrap();
        store
            .update_job(&done.id, &JobPatch::status(JobStatus::Completed))
            .await
            .unwrap();
        store.log_system(&done.id, LogLevel::Info, "done").await;

        let purged = store
            .purge_terminal_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, vec![done.id.clone()]);
        assert!(store.get_job(&done.id).await.unwrap().is_none());
        assert!(store.get_job(&active.id).await.unwrap().is_some());
    }
}
