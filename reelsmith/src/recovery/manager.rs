//! Applies the failure taxonomy to jobs and stages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::classify::{FailureClass, classify};
use super::policy::RecoveryConfig;
use crate::domain::{
    Job, JobPatch, JobStatus, LogLevel, NewRetryRecord, RetryResult, RetryStrategy, Stage,
    StageStatus,
};
use crate::error::WorkerFailure;
use crate::pipeline::{PipelineManager, state};
use crate::store::JobStore;
use crate::{Error, Result};

/// What happened to a failed stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Stage re-armed; it becomes claimable at `ready_at`.
    RetryScheduled {
        attempt: u32,
        ready_at: DateTime<Utc>,
    },
    /// Permanent failure.
    Failed,
    /// Transient failures exhausted the retry budget.
    Abandoned,
    Cancelled,
    /// Shutdown in progress; the stage stays running for orphan recovery.
    Interrupted,
    /// The job left its active state while the failure was handled.
    Superseded,
}

pub struct RecoveryManager {
    store: Arc<JobStore>,
    pipelines: PipelineManager,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(store: Arc<JobStore>, pipelines: PipelineManager, config: RecoveryConfig) -> Self {
        Self {
            store,
            pipelines,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Handle a failed run of the running `stage`.
    ///
    /// `baseline` is the job progress the stage started from; a scheduled
    /// retry resets the job to it.
    pub async fn handle_failure(
        &self,
        stage: &Stage,
        baseline: u8,
        failure: &WorkerFailure,
    ) -> Result<Disposition> {
        let class = classify(failure, &self.config);
        let job_id = stage.job_id.as_str();

        if class == FailureClass::Interrupted {
            info!(job_id = %job_id, stage = %stage.kind, "Stage interrupted by shutdown");
            return Ok(Disposition::Interrupted);
        }

        let summary = failure.summary();
        let level = if class == FailureClass::Cancelled {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        self.store
            .log_system(
                job_id,
                level,
                format!("{} stage failed ({class}): {summary}", stage.kind),
            )
            .await;

        let failed = self.pipelines.fail_stage(stage, &summary).await?;

        match class {
            FailureClass::Cancelled => {
                self.store
                    .transition_job(
                        job_id,
                        JobStatus::ACTIVE,
                        &JobPatch::status(JobStatus::Cancelled).with_step("cancelled"),
                    )
                    .await?;
                Ok(Disposition::Cancelled)
            }
            FailureClass::Permanent => {
                warn!(job_id = %job_id, stage = %stage.kind, error = %summary, "Permanent stage failure");
                let updated = self
                    .store
                    .transition_job(
                        job_id,
                        JobStatus::ACTIVE,
                        &JobPatch::status(JobStatus::Failed)
                            .with_error(&summary)
                            .with_step(format!("{} failed", stage.kind.label())),
                    )
                    .await?;
                Ok(match updated {
                    Some(_) => Disposition::Failed,
                    None => Disposition::Superseded,
                })
            }
            FailureClass::Transient => self.schedule_retry(&failed, baseline, &summary).await,
            FailureClass::Interrupted => Ok(Disposition::Interrupted),
        }
    }

    async fn schedule_retry(
        &self,
        failed: &Stage,
        baseline: u8,
        summary: &str,
    ) -> Result<Disposition> {
        let job_id = failed.job_id.as_str();
        let attempt = failed.retry_count + 1;
        let policy = &self.config.retry;

        self.store
            .retries()
            .record(&NewRetryRecord {
                error_id: failed.id.clone(),
                job_id: job_id.to_string(),
                strategy: RetryStrategy::ExponentialBackoff,
                result: RetryResult::Failed,
                error: Some(summary.to_string()),
            })
            .await?;

        if !policy.allows_retry_after(attempt) {
            return self
                .abandon(
                    job_id,
                    attempt,
                    format!("abandoned after {attempt} attempts: {summary}"),
                )
                .await;
        }

        let delay = policy.backoff(attempt);
        let ready_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        // Active to pending in one step: a concurrent cancel either wins this
        // CAS or cancels the pending job.
        let rearmed = self
            .store
            .transition_job(
                job_id,
                JobStatus::ACTIVE,
                &JobPatch::status(JobStatus::Pending)
                    .with_progress(baseline)
                    .with_retry_count(attempt)
                    .with_step(format!(
                        "retry {attempt}/{} scheduled",
                        policy.max_retries
                    )),
            )
            .await?;
        if rearmed.is_none() {
            info!(job_id = %job_id, stage = %failed.kind, "Job left its active state; retry dropped");
            return Ok(Disposition::Superseded);
        }
        self.pipelines
            .rearm_stage(failed, attempt, ready_at)
            .await?;

        info!(
            job_id = %job_id,
            stage = %failed.kind,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        self.store
            .log_system(
                job_id,
                LogLevel::Warning,
                format!(
                    "retry {attempt}/{} of {} scheduled in {}ms",
                    policy.max_retries,
                    failed.kind,
                    delay.as_millis()
                ),
            )
            .await;
        Ok(Disposition::RetryScheduled { attempt, ready_at })
    }

    async fn abandon(&self, job_id: &str, attempts: u32, message: String) -> Result<Disposition> {
        error!(job_id = %job_id, error = %message, "Job abandoned");
        let updated = self
            .store
            .transition_job(
                job_id,
                JobStatus::ACTIVE,
                &JobPatch::status(JobStatus::Abandoned)
                    .with_error(&message)
                    .with_retry_count(attempts)
                    .with_step("abandoned"),
            )
            .await?;
        if updated.is_some() {
            self.store.log_system(job_id, LogLevel::Error, message).await;
            Ok(Disposition::Abandoned)
        } else {
            Ok(Disposition::Superseded)
        }
    }

    /// Record the success of a stage that needed one or more retries.
    pub async fn record_success(&self, stage: &Stage) -> Result<()> {
        let history = self.store.retries().list_for_error(&stage.id).await?;
        let Some(last) = history.last() else {
            return Ok(());
        };
        if last.result == RetryResult::Success {
            return Ok(());
        }
        self.store
            .retries()
            .record(&NewRetryRecord {
                error_id: stage.id.clone(),
                job_id: stage.job_id.clone(),
                strategy: last.strategy,
                result: RetryResult::Success,
                error: None,
            })
            .await?;
        info!(job_id = %stage.job_id, stage = %stage.kind, attempts = history.len(), "Stage recovered");
        Ok(())
    }

    /// Reset stages left `running` by a previous process.
    ///
    /// Must run before the poller starts and before any worker is launched.
    pub async fn recover_orphans(&self) -> Result<usize> {
        let orphans = self
            .store
            .pipelines()
            .list_stages_by_status(StageStatus::Running)
            .await?;
        let mut recovered = 0;

        for stage in orphans {
            match self.recover_orphan(&stage).await {
                Ok(()) => recovered += 1,
                Err(e) => {
                    error!(job_id = %stage.job_id, stage = %stage.kind, error = %e, "Failed to recover orphaned stage");
                }
            }
        }
        if recovered > 0 {
            info!(count = recovered, "Recovered orphaned stages");
        }
        Ok(recovered)
    }

    async fn recover_orphan(&self, stage: &Stage) -> Result<()> {
        let job_id = stage.job_id.as_str();
        let message = "orchestrator restarted while the stage was running";

        let job = self.store.require_job(job_id).await?;
        if job.status.is_terminal() {
            self.pipelines
                .fail_stage(stage, format!("job already {}", job.status))
                .await?;
            return Ok(());
        }

        let attempt = stage.retry_count + 1;
        self.store
            .retries()
            .record(&NewRetryRecord {
                error_id: stage.id.clone(),
                job_id: job_id.to_string(),
                strategy: RetryStrategy::RestartComponent,
                result: RetryResult::Failed,
                error: Some(message.to_string()),
            })
            .await?;
        self.store
            .log_system(job_id, LogLevel::Warning, format!("{} stage: {message}", stage.kind))
            .await;

        if !self.config.retry.allows_retry_after(attempt) {
            self.pipelines.fail_stage(stage, message).await?;
            self.abandon(
                job_id,
                attempt,
                format!("abandoned after {attempt} attempts: {message}"),
            )
            .await?;
            return Ok(());
        }

        let pipeline = self.pipelines.pipeline(job_id).await?;
        let baseline = state::stage_baseline(stage.position, pipeline.stages.len());
        self.pipelines
            .rearm_stage(stage, attempt, Utc::now())
            .await?;
        self.store
            .transition_job(
                job_id,
                JobStatus::ACTIVE,
                &JobPatch::status(JobStatus::Pending)
                    .with_progress(baseline)
                    .with_retry_count(attempt)
                    .with_step(format!("{} restarted", stage.kind.label())),
            )
            .await?;
        Ok(())
    }

    /// Manual intervention: re-arm the failed stage of a failed or abandoned
    /// job with a fresh retry budget.
    pub async fn requeue(&self, job_id: &str) -> Result<Job> {
        let job = self
            .store
            .refresh_job(job_id)
            .await?
            .ok_or_else(|| Error::not_found("Job", job_id))?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Abandoned) {
            return Err(Error::invalid_transition(job.status, JobStatus::Pending));
        }

        let pipeline = self.pipelines.pipeline(job_id).await?;
        let stage = pipeline
            .failed_stage()
            .cloned()
            .ok_or_else(|| Error::validation(format!("job {job_id} has no failed stage")))?;

        self.store
            .retries()
            .record(&NewRetryRecord {
                error_id: stage.id.clone(),
                job_id: job_id.to_string(),
                strategy: RetryStrategy::ManualFix,
                result: RetryResult::Failed,
                error: stage.error.clone(),
            })
            .await?;

        self.pipelines.rearm_stage(&stage, 0, Utc::now()).await?;
        let baseline = state::stage_baseline(stage.position, pipeline.stages.len());
        let from = job.status;
        let job = self
            .store
            .transition_job(
                job_id,
                &[JobStatus::Failed, JobStatus::Abandoned],
                &JobPatch::status(JobStatus::Pending)
                    .with_progress(baseline)
                    .with_retry_count(0)
                    .with_step("requeued"),
            )
            .await?
            .ok_or_else(|| Error::invalid_transition(from, JobStatus::Pending))?;

        info!(job_id = %job_id, stage = %stage.kind, "Job requeued");
        self.store
            .log_system(job_id, LogLevel::Info, format!("requeued at {} stage", stage.kind))
            .await;
        Ok(job)
    }
}
