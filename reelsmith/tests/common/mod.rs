#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use reelsmith::config::OrchestratorConfig;
use reelsmith::database::Database;
use reelsmith::domain::StageKind;
use reelsmith::recovery::RetryPolicy;
use reelsmith::service::JobStatusView;
use reelsmith::supervisor::{ArtifactSpec, WorkerTemplate};
use reelsmith::Orchestrator;
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub orch: Orchestrator,
}

impl Harness {
    pub fn db_url(dir: &TempDir) -> String {
        format!(
            "sqlite:{}?mode=rwc",
            dir.path().join("reelsmith.db").to_string_lossy().replace('\\', "/")
        )
    }

    /// Fast polling, short fixed retry delays, no default workers.
    pub fn config(dir: &TempDir) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.database_url = Self::db_url(dir);
        config.log_dir = dir.path().join("logs");
        config.supervisor.work_dir = dir.path().join("work");
        config.supervisor.drain_grace_ms = 500;
        config.poller.poll_interval_ms = 20;
        config.poller.max_concurrent = 4;
        config.recovery.retry = RetryPolicy::fixed(3, 20);
        config.workers = HashMap::new();
        config
    }

    pub async fn start(dir: TempDir, config: OrchestratorConfig) -> Self {
        let db = Database::connect(&config.database_url).await.unwrap();
        let orch = Orchestrator::new(config, db).await.unwrap();
        orch.start().await.unwrap();
        Self { dir, orch }
    }

    pub fn work_dir(&self, job_id: &str) -> PathBuf {
        self.dir.path().join("work").join(job_id)
    }

    /// Poll `get_status` until `done` holds, panicking after `timeout`.
    pub async fn wait_for<F>(&self, job_id: &str, timeout: Duration, done: F) -> JobStatusView
    where
        F: Fn(&JobStatusView) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let view = self.orch.get_status(job_id).await.unwrap();
            if done(&view) {
                return view;
            }
            if Instant::now() > deadline {
                panic!(
                    "timed out waiting for job {job_id}: status={} step={:?} logs={:#?}",
                    view.job.status,
                    view.job.step,
                    view.logs.iter().map(|l| &l.message).collect::<Vec<_>>()
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_terminal(&self, job_id: &str) -> JobStatusView {
        self.wait_for(job_id, Duration::from_secs(20), |v| v.job.status.is_terminal())
            .await
    }
}

/// `sh -c <script>` worker.
pub fn sh(script: &str) -> WorkerTemplate {
    WorkerTemplate::new("sh").with_args(["-c", script])
}

pub fn sh_with_artifact(script: &str, artifact: ArtifactSpec) -> WorkerTemplate {
    sh(script).with_artifact(artifact)
}

pub fn workers(entries: Vec<(StageKind, WorkerTemplate)>) -> HashMap<StageKind, WorkerTemplate> {
    entries.into_iter().collect()
}
