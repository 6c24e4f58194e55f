//! Validated stage transitions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::database::repositories::StageChange;
use crate::domain::{Pipeline, Stage, StageStatus};
use crate::store::JobStore;
use crate::{Error, Result};

/// Moves stages through `pending -> running -> completed | failed` and back.
///
/// Every transition is checked against [`StageStatus::can_transition_to`] and
/// applied with a guarded update, so a stage changed concurrently yields
/// `InvalidStateTransition` instead of a lost write.
#[derive(Clone)]
pub struct PipelineManager {
    store: Arc<JobStore>,
}

impl PipelineManager {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }

    pub async fn pipeline(&self, job_id: &str) -> Result<Pipeline> {
        self.store.get_pipeline(job_id).await
    }

    pub async fn transition(
        &self,
        stage: &Stage,
        to: StageStatus,
        change: &StageChange,
    ) -> Result<Stage> {
        stage.status.transition(to)?;

        match self
            .store
            .pipelines()
            .transition_stage(stage, to, change)
            .await?
        {
            Some(updated) => {
                debug!(
                    job_id = %stage.job_id,
                    stage = %stage.kind,
                    from = %stage.status,
                    to = %to,
                    "Stage transition"
                );
                Ok(updated)
            }
            None => {
                let current = self
                    .store
                    .pipelines()
                    .get_stage(&stage.id)
                    .await?
                    .ok_or_else(|| Error::not_found("Stage", &stage.id))?;
                Err(Error::invalid_transition(current.status, to))
            }
        }
    }

    pub async fn start_stage(&self, stage: &Stage) -> Result<Stage> {
        self.transition(stage, StageStatus::Running, &StageChange::default())
            .await
    }

    pub async fn complete_stage(&self, stage: &Stage, artifact_ref: Option<String>) -> Result<Stage> {
        self.transition(
            stage,
            StageStatus::Completed,
            &StageChange {
                artifact_ref,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn fail_stage(&self, stage: &Stage, error: impl Into<String>) -> Result<Stage> {
        self.transition(
            stage,
            StageStatus::Failed,
            &StageChange {
                error: Some(error.into()),
                ..Default::default()
            },
        )
        .await
    }

    /// Back to `pending`, eligible from `ready_at` on. Works from `failed`
    /// (retry, requeue) and from `running` (orphan recovery).
    pub async fn rearm_stage(
        &self,
        stage: &Stage,
        retry_count: u32,
        ready_at: DateTime<Utc>,
    ) -> Result<Stage> {
        self.transition(
            stage,
            StageStatus::Pending,
            &StageChange {
                retry_count: Some(retry_count),
                ready_at: Some(ready_at),
                ..Default::default()
            },
        )
        .await
    }
}
