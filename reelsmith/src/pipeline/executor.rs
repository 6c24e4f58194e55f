//! Runs one claimed stage from launch to its recorded outcome.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::batch::{self, BatchPolicy};
use super::manager::PipelineManager;
use super::state;
use crate::domain::{
    BatchItemStatus, BatchSummary, Job, JobPatch, JobStatus, LogLevel, Pipeline, Stage, StageKind,
};
use crate::error::WorkerFailure;
use crate::recovery::RecoveryManager;
use crate::store::JobStore;
use crate::supervisor::{Reservation, Supervisor, TemplateContext, WorkerTemplate};
use crate::{Error, Result};

/// What a successful stage hands back.
#[derive(Debug, Default)]
struct StageSuccess {
    artifact: Option<String>,
    note: Option<String>,
}

pub struct StageExecutor {
    store: Arc<JobStore>,
    supervisor: Arc<Supervisor>,
    pipelines: PipelineManager,
    recovery: Arc<RecoveryManager>,
    workers: HashMap<StageKind, WorkerTemplate>,
    batch: BatchPolicy,
    notify: Arc<Notify>,
}

impl StageExecutor {
    pub fn new(
        store: Arc<JobStore>,
        supervisor: Arc<Supervisor>,
        recovery: Arc<RecoveryManager>,
        workers: HashMap<StageKind, WorkerTemplate>,
        batch: BatchPolicy,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            pipelines: PipelineManager::new(store.clone()),
            store,
            supervisor,
            recovery,
            workers,
            batch,
            notify,
        }
    }

    /// Execute a stage claimed by the poller (status `running`).
    pub async fn execute(&self, stage: Stage) {
        if let Err(e) = self.try_execute(&stage).await {
            // The stage stays running and is recovered as an orphan on restart.
            error!(job_id = %stage.job_id, stage = %stage.kind, error = %e, "Stage execution failed");
        }
    }

    async fn try_execute(&self, stage: &Stage) -> Result<()> {
        let job_id = stage.job_id.as_str();
        let pipeline = self.pipelines.pipeline(job_id).await?;
        let baseline = state::stage_baseline(stage.position, pipeline.stages.len());

        let Some(job) = self
            .store
            .transition_job(
                job_id,
                JobStatus::ACTIVE,
                &JobPatch::status(JobStatus::Processing).with_step(stage.kind.label()),
            )
            .await?
        else {
            self.pipelines
                .fail_stage(stage, "job is no longer active")
                .await?;
            return Ok(());
        };

        let reservation = match self.supervisor.reserve(job_id) {
            Ok(reservation) => reservation,
            Err(Error::AlreadyRunning { .. }) => {
                warn!(job_id = %job_id, stage = %stage.kind, "Worker slot busy; stage deferred");
                self.pipelines
                    .rearm_stage(stage, stage.retry_count, Utc::now() + chrono::Duration::seconds(1))
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // A cancel that landed before the slot was reserved found nothing to kill.
        let current = self
            .store
            .refresh_job(job_id)
            .await?
            .ok_or_else(|| Error::not_found("Job", job_id))?;
        if current.status.is_terminal() {
            drop(reservation);
            self.recovery
                .handle_failure(stage, baseline, &WorkerFailure::Cancelled)
                .await?;
            return Ok(());
        }

        let attempt = if stage.retry_count > 0 {
            format!(" (retry {})", stage.retry_count)
        } else {
            String::new()
        };
        info!(job_id = %job_id, stage = %stage.kind, retry = stage.retry_count, "Stage started");
        self.store
            .log_system(job_id, LogLevel::Info, format!("{} stage started{attempt}", stage.kind))
            .await;

        let started = Instant::now();
        let result = match self.workers.get(&stage.kind) {
            None => {
                drop(reservation);
                Err(WorkerFailure::PermanentInput(format!(
                    "no worker configured for {} stages",
                    stage.kind
                )))
            }
            Some(template) => {
                let work_dir = self.supervisor.work_dir_for(job_id);
                let input = pipeline.input_for(stage.position);
                match (stage.kind, batch::items_from_payload(&job.payload)) {
                    (StageKind::Crawl, Some(items)) => {
                        self.run_batch(reservation, &job, stage, template, &work_dir, input, baseline, items)
                            .await
                    }
                    _ => {
                        self.run_single(reservation, &job, stage, template, &work_dir, input, baseline)
                            .await
                    }
                }
            }
        };

        match result {
            Ok(success) => {
                info!(
                    job_id = %job_id,
                    stage = %stage.kind,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Stage completed"
                );
                self.on_success(stage, &pipeline, success).await
            }
            Err(failure) => {
                let disposition = self
                    .recovery
                    .handle_failure(stage, baseline, &failure)
                    .await?;
                debug!(job_id = %job_id, stage = %stage.kind, ?disposition, "Stage failure handled");
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_single(
        &self,
        reservation: Reservation,
        job: &Job,
        stage: &Stage,
        template: &WorkerTemplate,
        work_dir: &Path,
        input: Option<&str>,
        baseline: u8,
    ) -> std::result::Result<StageSuccess, WorkerFailure> {
        let ctx = TemplateContext {
            job_id: &job.id,
            stage: stage.kind,
            work_dir,
            input,
            title: &job.title,
            payload: &job.payload,
            item: None,
        };
        let spec = template.render(&ctx, self.supervisor.config().job_timeout());
        let outcome = self
            .supervisor
            .launch(reservation, spec, baseline)
            .wait()
            .await?;

        Ok(StageSuccess {
            artifact: outcome.artifact.map(|p| p.display().to_string()),
            note: None,
        })
    }

    /// Run one worker per item, sequentially, recording each outcome.
    ///
    /// Item failures do not stop the batch; cancellation and shutdown do.
    #[allow(clippy::too_many_arguments)]
    async fn run_batch(
        &self,
        reservation: Reservation,
        job: &Job,
        stage: &Stage,
        template: &WorkerTemplate,
        work_dir: &Path,
        input: Option<&str>,
        baseline: u8,
        items: Vec<String>,
    ) -> std::result::Result<StageSuccess, WorkerFailure> {
        if items.is_empty() {
            return Err(WorkerFailure::PermanentInput(
                "batch payload has no items".to_string(),
            ));
        }

        let total = items.len();
        let mut summary = BatchSummary::default();
        let mut reservation = Some(reservation);

        for (offset, item) in items.iter().enumerate() {
            let index = offset as u32 + 1;
            let slot = match reservation.take() {
                Some(slot) => slot,
                None => {
                    let current = self
                        .store
                        .refresh_job(&job.id)
                        .await
                        .map_err(|e| WorkerFailure::TransientInfra(e.to_string()))?;
                    if current.is_none_or(|j| j.status.is_terminal()) {
                        return Err(WorkerFailure::Cancelled);
                    }
                    self.supervisor
                        .reserve(&job.id)
                        .map_err(|e| WorkerFailure::TransientInfra(e.to_string()))?
                }
            };

            let ctx = TemplateContext {
                job_id: &job.id,
                stage: stage.kind,
                work_dir,
                input,
                title: &job.title,
                payload: &job.payload,
                item: Some((index, item)),
            };
            let spec = template.render(&ctx, self.supervisor.config().job_timeout());
            let progress = state::batch_progress(baseline, offset, total);
            let result = self.supervisor.launch(slot, spec, progress).wait().await;

            let (status, error) = match result {
                Ok(_) => (BatchItemStatus::Succeeded, None),
                Err(failure @ (WorkerFailure::Cancelled | WorkerFailure::Interrupted)) => {
                    return Err(failure);
                }
                Err(failure) => {
                    let summary = failure.summary();
                    self.store
                        .log_system(
                            &job.id,
                            LogLevel::Warning,
                            format!("item {index}/{total} ({item}) failed: {summary}"),
                        )
                        .await;
                    (BatchItemStatus::Failed, Some(summary))
                }
            };

            if let Err(e) = self
                .store
                .batches()
                .record_item(&job.id, index, item, status, error.as_deref())
                .await
            {
                warn!(job_id = %job.id, item = index, error = %e, "Failed to record batch item");
            }
            summary.total += 1;
            match status {
                BatchItemStatus::Succeeded => summary.succeeded += 1,
                BatchItemStatus::Failed => {
                    summary.failed += 1;
                    summary.failed_items.push(index);
                }
            }

            let progress = state::batch_progress(baseline, offset + 1, total);
            if let Err(e) = self
                .store
                .advance_progress(&job.id, progress, &format!("{} {index}/{total}", stage.kind.label()))
                .await
            {
                warn!(job_id = %job.id, error = %e, "Failed to record batch progress");
            }
        }

        info!(
            job_id = %job.id,
            succeeded = summary.succeeded,
            total = summary.total,
            failed_items = ?summary.failed_items,
            "Batch finished"
        );

        if !self.batch.is_satisfied(&summary) {
            return Err(WorkerFailure::BatchBelowThreshold {
                succeeded: summary.succeeded,
                total: summary.total,
            });
        }

        Ok(StageSuccess {
            artifact: Some(work_dir.display().to_string()),
            note: Some(BatchPolicy::completion_note(&summary)),
        })
    }

    async fn on_success(&self, stage: &Stage, pipeline: &Pipeline, success: StageSuccess) -> Result<()> {
        let job_id = stage.job_id.as_str();
        self.pipelines
            .complete_stage(stage, success.artifact.clone())
            .await?;
        self.recovery.record_success(stage).await?;

        if pipeline.is_last(stage.position) {
            let artifact = success.artifact.or_else(|| {
                pipeline
                    .stages
                    .iter()
                    .rev()
                    .filter(|s| s.position < stage.position)
                    .find_map(|s| s.artifact_ref.clone())
            });
            let mut patch = JobPatch::status(JobStatus::Completed)
                .with_progress(100)
                .with_retry_count(0)
                .with_step("completed");
            if let Some(artifact) = artifact {
                patch = patch.with_artifact(artifact);
            }
            if let Some(note) = &success.note {
                patch = patch.with_completion_note(note);
            }

            match self
                .store
                .transition_job(job_id, JobStatus::ACTIVE, &patch)
                .await?
            {
                Some(job) => {
                    info!(job_id = %job_id, artifact = ?job.artifact_ref, "Job completed");
                    let message = match &success.note {
                        Some(note) => format!("job completed: {note}"),
                        None => "job completed".to_string(),
                    };
                    self.store.log_system(job_id, LogLevel::Info, message).await;
                }
                None => debug!(job_id = %job_id, "Job left active state before completion"),
            }
            return Ok(());
        }

        let mark = state::completion_mark(stage.position, pipeline.stages.len());
        self.store
            .advance_progress(job_id, mark, &format!("{} done", stage.kind.label()))
            .await?;
        let next = pipeline
            .stages
            .iter()
            .find(|s| s.position == stage.position + 1)
            .map(|s| s.kind.label())
            .unwrap_or("next stage");
        self.store
            .transition_job(
                job_id,
                &[JobStatus::Processing],
                &JobPatch::status(JobStatus::Pending)
                    .with_retry_count(0)
                    .with_step(format!("waiting for {next}")),
            )
            .await?;
        self.notify.notify_one();
        Ok(())
    }
}
