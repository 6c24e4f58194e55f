//! Pipeline and stage entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{JobKind, JobStatus};
use crate::{Error, Result};

/// One phase of a pipeline.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Script,
    Video,
    Upload,
    Publish,
    Crawl,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Ordered stage plan for a job kind.
    pub fn plan_for(kind: JobKind) -> &'static [StageKind] {
        match kind {
            JobKind::ScriptOnly => &[StageKind::Script],
            JobKind::FullVideo => &[
                StageKind::Script,
                StageKind::Video,
                StageKind::Upload,
                StageKind::Publish,
            ],
            JobKind::ShortsConversion => &[StageKind::Video, StageKind::Upload],
            JobKind::Crawl => &[StageKind::Crawl],
        }
    }

    /// Human-readable label used for `Job.step`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Script => "script generation",
            Self::Video => "video rendering",
            Self::Upload => "upload",
            Self::Publish => "publishing",
            Self::Crawl => "image crawl",
        }
    }
}

/// Stage status values.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Allowed transitions:
    ///
    /// - `pending -> running`
    /// - `running -> completed | failed`
    /// - `failed -> pending` (retry or manual requeue)
    /// - `running -> pending` (orphan recovery after a crash)
    pub fn can_transition_to(&self, to: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Pending)
                | (Running, Pending)
        )
    }

    /// Validate a transition.
    pub fn transition(self, to: StageStatus) -> Result<StageStatus> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(Error::invalid_transition(self, to))
        }
    }
}

/// One phase of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub pipeline_id: String,
    pub job_id: String,
    pub position: u32,
    pub kind: StageKind,
    pub status: StageStatus,
    pub ready_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub artifact_ref: Option<String>,
}

/// Derived pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "state")]
pub enum PipelineState {
    /// Some stage is pending or running.
    Active,
    /// Parked at a failed stage, waiting for recovery.
    Parked { failed_position: u32 },
    /// Last stage completed.
    Done,
    /// Parked permanently: retries exhausted or the job was cancelled.
    Abandoned { failed_position: u32 },
}

/// Ordered stage sequence owned by one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub job_id: String,
    pub schedule_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn failed_stage(&self) -> Option<&Stage> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::Failed)
    }

    pub fn running_stage(&self) -> Option<&Stage> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::Running)
    }

    /// Artifact of the completed stage right before `position`.
    pub fn input_for(&self, position: u32) -> Option<&str> {
        position
            .checked_sub(1)
            .and_then(|prev| self.stages.iter().find(|s| s.position == prev))
            .filter(|s| s.status == StageStatus::Completed)
            .and_then(|s| s.artifact_ref.as_deref())
    }

    pub fn is_last(&self, position: u32) -> bool {
        self.stages
            .iter()
            .map(|s| s.position)
            .max()
            .is_some_and(|last| last == position)
    }

    pub fn state(&self, job_status: JobStatus) -> PipelineState {
        if let Some(failed) = self.failed_stage() {
            return if matches!(job_status, JobStatus::Abandoned | JobStatus::Cancelled) {
                PipelineState::Abandoned {
                    failed_position: failed.position,
                }
            } else {
                PipelineState::Parked {
                    failed_position: failed.position,
                }
            };
        }
        if !self.stages.is_empty()
            && self.stages.iter().all(|s| s.status == StageStatus::Completed)
        {
            return PipelineState::Done;
        }
        PipelineState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(position: u32, kind: StageKind, status: StageStatus) -> Stage {
        Stage {
            id: format!("s{position}"),
            pipeline_id: "p".to_string(),
            job_id: "j".to_string(),
            position,
            kind,
            status,
            ready_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error: None,
            artifact_ref: Some(format!("/out/{position}")),
        }
    }

    #[test]
    fn full_video_plan_is_ordered() {
        assert_eq!(
            StageKind::plan_for(JobKind::FullVideo),
            &[
                StageKind::Script,
                StageKind::Video,
                StageKind::Upload,
                StageKind::Publish
            ]
        );
        assert_eq!(StageKind::plan_for(JobKind::Crawl), &[StageKind::Crawl]);
    }

    #[test]
    fn stage_transitions() {
        assert!(StageStatus::Pending.transition(StageStatus::Running).is_ok());
        assert!(StageStatus::Failed.transition(StageStatus::Pending).is_ok());
        assert!(StageStatus::Pending.transition(StageStatus::Completed).is_err());
        assert!(StageStatus::Completed.transition(StageStatus::Running).is_err());
    }

    #[test]
    fn pipeline_state_and_inputs() {
        let mut pipeline = Pipeline {
            id: "p".to_string(),
            job_id: "j".to_string(),
            schedule_id: None,
            created_at: Utc::now(),
            stages: vec![
                stage(0, StageKind::Script, StageStatus::Completed),
                stage(1, StageKind::Video, StageStatus::Failed),
            ],
        };
        assert_eq!(
            pipeline.state(JobStatus::Pending),
            PipelineState::Parked { failed_position: 1 }
        );
        assert_eq!(
            pipeline.state(JobStatus::Abandoned),
            PipelineState::Abandoned { failed_position: 1 }
        );
        assert_eq!(pipeline.input_for(1), Some("/out/0"));
        assert_eq!(pipeline.input_for(0), None);
        assert!(pipeline.is_last(1));

        pipeline.stages[1].status = StageStatus::Completed;
        assert_eq!(pipeline.state(JobStatus::Completed), PipelineState::Done);
    }
}
