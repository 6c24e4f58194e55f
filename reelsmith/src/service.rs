//! Orchestrator facade.
//!
//! Wires the job store, classifier, supervisor, pipeline and recovery
//! components together and owns the poller lifecycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::classifier::{Classifier, RuleSet};
use crate::config::OrchestratorConfig;
use crate::database::Database;
use crate::database::repositories::{JobCount, SqlxSettingsRepository};
use crate::database::time::datetime_to_ms;
use crate::domain::{
    BatchItem, BatchSummary, Job, JobKind, JobPatch, JobStatus, LogEntry, LogLevel, NewJob,
    PipelineState, RetryRecord, Stage, StageKind,
};
use crate::pipeline::{PipelineManager, StageExecutor, StagePoller};
use crate::recovery::RecoveryManager;
use crate::store::JobStore;
use crate::supervisor::Supervisor;
use crate::utils::fs::remove_dir_all_if_exists;
use crate::{Error, Result};

/// Default shutdown grace for live workers.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// A request to start a new job.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub kind: JobKind,
    pub title: String,
    pub owner_id: String,
    pub payload: Value,
    /// Caller's schedule, kept as a back-reference on the pipeline.
    pub schedule_id: Option<String>,
    /// Do not start before this time.
    pub run_at: Option<DateTime<Utc>>,
    /// Higher priorities are claimed first.
    pub priority: i32,
}

impl SubmitRequest {
    pub fn new(kind: JobKind, title: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            owner_id: owner_id.into(),
            payload: Value::Object(Default::default()),
            schedule_id: None,
            run_at: None,
            priority: 0,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::validation("title cannot be empty"));
        }
        if self.owner_id.trim().is_empty() {
            return Err(Error::validation("owner_id cannot be empty"));
        }
        if !self.payload.is_object() {
            return Err(Error::validation("payload must be a JSON object"));
        }
        Ok(())
    }
}

/// Everything known about one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job: Job,
    pub pipeline: PipelineState,
    pub stages: Vec<Stage>,
    pub logs: Vec<LogEntry>,
    pub retries: Vec<RetryRecord>,
    /// Ready stages of the same kind ahead of this job; `None` unless the
    /// job is waiting for its next stage.
    pub queue_position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub batch_items: Vec<BatchItem>,
}

/// A stage running for longer than the configured threshold.
#[derive(Debug, Clone, Serialize)]
pub struct StuckStage {
    pub job_id: String,
    pub stage: StageKind,
    pub started_at: Option<DateTime<Utc>>,
    /// Whether a worker process is attached to it in this orchestrator.
    pub live: bool,
    pub pid: Option<u32>,
    /// Age of the attached worker process.
    pub process_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub live_processes: usize,
    pub active_stages: usize,
    pub stuck: Vec<StuckStage>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    db: Database,
    store: Arc<JobStore>,
    supervisor: Arc<Supervisor>,
    recovery: Arc<RecoveryManager>,
    poller: StagePoller,
    notify: Arc<Notify>,
    cancellation_token: CancellationToken,
}

impl Orchestrator {
    /// Build every component. Persisted runtime settings override `config`.
    pub async fn new(mut config: OrchestratorConfig, db: Database) -> Result<Self> {
        let settings = SqlxSettingsRepository::new(db.read.clone(), db.write.clone());
        config.apply_persisted_settings(&settings).await;
        config.validate()?;

        let store = Arc::new(JobStore::new(&db));
        let classifier = Arc::new(Classifier::new(RuleSet::from_config(&config.rules)?));
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            classifier,
            config.supervisor.clone(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            store.clone(),
            PipelineManager::new(store.clone()),
            config.recovery.clone(),
        ));
        let notify = Arc::new(Notify::new());
        let executor = Arc::new(StageExecutor::new(
            store.clone(),
            supervisor.clone(),
            recovery.clone(),
            config.workers.clone(),
            config.batch.clone(),
            notify.clone(),
        ));
        let poller = StagePoller::new(
            store.clone(),
            executor,
            notify.clone(),
            config.poller.clone(),
        );

        Ok(Self {
            config,
            db,
            store,
            supervisor,
            recovery,
            poller,
            notify,
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Recover orphaned stages, then start the poller.
    pub async fn start(&self) -> Result<()> {
        let recovered = self.recovery.recover_orphans().await?;
        if recovered > 0 {
            info!(count = recovered, "Recovered orphaned stages");
        }
        self.poller.start();
        self.notify.notify_one();
        info!("Orchestrator started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown_with_grace(DEFAULT_SHUTDOWN_GRACE).await;
    }

    /// Kill live workers and stop the poller. Interrupted stages stay
    /// `running` and are recovered as orphans by the next [`start`](Self::start).
    pub async fn shutdown_with_grace(&self, grace: Duration) {
        info!(grace = ?grace, "Shutting down orchestrator");
        self.cancellation_token.cancel();
        self.supervisor.shutdown(grace).await;
        self.poller.stop().await;
        self.db.close().await;
        info!("Orchestrator shut down");
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Create a job and its pipeline. Duplicate requests create distinct jobs.
    pub async fn submit(&self, request: SubmitRequest) -> Result<String> {
        request.validate()?;

        let new_job = NewJob {
            title: request.title,
            kind: request.kind,
            owner_id: request.owner_id,
            payload: request.payload,
            priority: request.priority,
        };
        let (job, pipeline) = self
            .store
            .create_job(&new_job, request.schedule_id.as_deref(), request.run_at)
            .await?;

        info!(
            job_id = %job.id,
            kind = %job.kind,
            priority = job.priority,
            stages = pipeline.stages.len(),
            run_at = ?request.run_at,
            "Job submitted"
        );
        let message = match request.run_at {
            Some(at) => format!("job submitted, scheduled for {}", at.to_rfc3339()),
            None => "job submitted".to_string(),
        };
        self.store.log_system(&job.id, LogLevel::Info, message).await;
        self.notify.notify_one();
        Ok(job.id)
    }

    pub async fn get_status(&self, job_id: &str) -> Result<JobStatusView> {
        let job = self.store.require_job(job_id).await?;
        let pipeline = self.store.get_pipeline(job_id).await?;
        let logs = self.store.list_logs(job_id).await?;
        let retries = self.store.retries().list_for_job(job_id).await?;
        let batch_items = self.store.batches().list_items(job_id).await?;
        let batch = (!batch_items.is_empty()).then(|| BatchSummary::from_items(&batch_items));
        let queue_position = self.store.pipelines().queue_position(job_id).await?;

        Ok(JobStatusView {
            pipeline: pipeline.state(job.status),
            stages: pipeline.stages,
            job,
            logs,
            retries,
            queue_position,
            batch,
            batch_items,
        })
    }

    /// Position of the job among waiting stages of the same kind, 0 being
    /// next. `None` when the job is running, scheduled later, or finished.
    pub async fn queue_position(&self, job_id: &str) -> Result<Option<i64>> {
        self.store.require_job(job_id).await?;
        self.store.pipelines().queue_position(job_id).await
    }

    /// Cancel a job. Cancelling a job that already reached a terminal state
    /// returns it unchanged.
    pub async fn cancel(&self, job_id: &str) -> Result<Job> {
        let job = self.store.require_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        let cancelled = self
            .store
            .transition_job(
                job_id,
                JobStatus::ACTIVE,
                &JobPatch::status(JobStatus::Cancelled).with_step("cancelled"),
            )
            .await?;

        let Some(cancelled) = cancelled else {
            // Reached a terminal state concurrently.
            return self.store.require_job(job_id).await;
        };

        let killed = self.supervisor.cancel(job_id);
        info!(job_id = %job_id, killed, "Job cancelled");
        self.store
            .log_system(job_id, LogLevel::Info, "job cancelled by operator")
            .await;
        Ok(cancelled)
    }

    /// Re-arm the failed stage of a `failed` or `abandoned` job.
    pub async fn requeue(&self, job_id: &str) -> Result<Job> {
        let job = self.recovery.requeue(job_id).await?;
        self.notify.notify_one();
        Ok(job)
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        self.store.list_jobs(status, limit).await
    }

    /// Job counts by kind and status.
    pub async fn queue_summary(&self) -> Result<Vec<JobCount>> {
        self.store.count_jobs().await
    }

    /// Report stages running longer than `stuck_after_secs`.
    pub async fn health(&self) -> Result<HealthReport> {
        let threshold = chrono::Duration::seconds(self.recovery.config().stuck_after_secs as i64);
        let cutoff = datetime_to_ms(Utc::now() - threshold);

        let stuck: Vec<StuckStage> = self
            .store
            .pipelines()
            .list_stuck_stages(cutoff)
            .await?
            .into_iter()
            .map(|stage| StuckStage {
                live: self.supervisor.is_live(&stage.job_id),
                pid: self.supervisor.pid(&stage.job_id),
                process_secs: self
                    .supervisor
                    .running_for(&stage.job_id)
                    .map(|d| d.as_secs()),
                job_id: stage.job_id,
                stage: stage.kind,
                started_at: stage.started_at,
            })
            .collect();

        for s in &stuck {
            warn!(job_id = %s.job_id, stage = %s.stage, started_at = ?s.started_at, "Stage appears stuck");
        }

        Ok(HealthReport {
            healthy: stuck.is_empty(),
            live_processes: self.supervisor.live_count(),
            active_stages: self.poller.active_count(),
            stuck,
        })
    }

    /// Delete terminal jobs idle for longer than `older_than` (the configured
    /// retention when `None`), together with their work directories.
    pub async fn purge(&self, older_than: Option<Duration>) -> Result<Vec<String>> {
        let age = match older_than {
            Some(age) => chrono::Duration::from_std(age)
                .map_err(|e| Error::validation(format!("invalid purge age: {e}")))?,
            None => chrono::Duration::days(i64::from(self.config.retention.purge_after_days)),
        };
        let ids = self.store.purge_terminal_before(Utc::now() - age).await?;

        for id in &ids {
            if let Err(e) = remove_dir_all_if_exists(&self.supervisor.work_dir_for(id)).await {
                warn!(job_id = %id, error = %e, "Failed to remove job work directory");
            }
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "Purged terminal jobs");
        }
        Ok(ids)
    }
}
