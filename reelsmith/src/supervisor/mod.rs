//! Process supervisor.
//!
//! Owns every live worker process. A job id maps to at most one live
//! process: the registry slot is reserved before spawning and released by
//! the supervising task before its result is delivered, so callers that
//! observe a result can immediately start the next stage.

mod artifact;
mod runner;
mod spec;

pub use artifact::ArtifactSpec;
pub use spec::{TemplateContext, WorkerSpec, WorkerTemplate, slugify};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::Classifier;
use crate::error::WorkerFailure;
use crate::store::JobStore;
use crate::utils::fs::ensure_dir_all_sync_with_op;
use crate::{Error, Result};

/// Successful worker run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub exit_code: i32,
    /// Verified artifact, when the worker declares one.
    pub artifact: Option<PathBuf>,
    pub duration: Duration,
}

pub type RunResult = std::result::Result<RunOutcome, WorkerFailure>;

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Root of the per-job work directories.
    pub work_dir: PathBuf,
    /// Default wall-clock limit per worker run.
    pub job_timeout_secs: u64,
    /// Stderr lines kept for failure summaries.
    pub stderr_tail_lines: usize,
    /// How long to wait for buffered output after the process ended.
    pub drain_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./work"),
            job_timeout_secs: 3600, // 1 hour
            stderr_tail_lines: 20,
            drain_grace_ms: 2000,
        }
    }
}

impl SupervisorConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[derive(Debug)]
struct LiveProcess {
    generation: u64,
    cancel: CancellationToken,
    pid: Option<u32>,
    started_at: Instant,
}

/// A reserved registry slot. Dropping it without launching frees the slot.
pub struct Reservation {
    job_id: String,
    generation: u64,
    cancel: CancellationToken,
    live: Arc<DashMap<String, LiveProcess>>,
    launched: bool,
}

impl Reservation {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.launched {
            let generation = self.generation;
            self.live
                .remove_if(&self.job_id, |_, p| p.generation == generation);
        }
    }
}

/// Handle to a launched worker.
#[derive(Debug)]
pub struct ProcessHandle {
    job_id: String,
    pid: Option<u32>,
    result: oneshot::Receiver<RunResult>,
}

impl ProcessHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the worker's fate. The registry slot is already free when
    /// this returns.
    pub async fn wait(self) -> RunResult {
        self.result.await.unwrap_or(Err(WorkerFailure::Interrupted))
    }
}

pub struct Supervisor {
    store: Arc<JobStore>,
    classifier: Arc<Classifier>,
    config: SupervisorConfig,
    live: Arc<DashMap<String, LiveProcess>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(store: Arc<JobStore>, classifier: Arc<Classifier>, config: SupervisorConfig) -> Self {
        Self {
            store,
            classifier,
            config,
            live: Arc::new(DashMap::new()),
            generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn work_dir_for(&self, job_id: &str) -> PathBuf {
        job_work_dir(&self.config.work_dir, job_id)
    }

    /// Claim the registry slot for `job_id`.
    pub fn reserve(&self, job_id: &str) -> Result<Reservation> {
        match self.live.entry(job_id.to_string()) {
            Entry::Occupied(_) => Err(Error::AlreadyRunning {
                job_id: job_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                slot.insert(LiveProcess {
                    generation,
                    cancel: cancel.clone(),
                    pid: None,
                    started_at: Instant::now(),
                });
                Ok(Reservation {
                    job_id: job_id.to_string(),
                    generation,
                    cancel,
                    live: self.live.clone(),
                    launched: false,
                })
            }
        }
    }

    /// Reserve and launch in one step.
    pub fn start(&self, job_id: &str, spec: WorkerSpec, baseline: u8) -> Result<ProcessHandle> {
        let reservation = self.reserve(job_id)?;
        Ok(self.launch(reservation, spec, baseline))
    }

    /// Spawn the worker for a reserved slot.
    ///
    /// Spawn and work-dir failures are reported through the handle, like any
    /// other worker failure.
    pub fn launch(&self, mut reservation: Reservation, spec: WorkerSpec, baseline: u8) -> ProcessHandle {
        let job_id = reservation.job_id.clone();
        let (tx, rx) = oneshot::channel();

        let child = ensure_dir_all_sync_with_op("creating work directory", &spec.work_dir)
            .map_err(|e| WorkerFailure::TransientInfra(e.to_string()))
            .and_then(|()| {
                runner::build_command(&spec, &job_id)
                    .spawn()
                    .map_err(|source| WorkerFailure::Spawn {
                        program: spec.program.clone(),
                        source,
                    })
            });

        let child = match child {
            Ok(child) => child,
            Err(failure) => {
                warn!(job_id = %job_id, program = %spec.program, error = %failure, "Worker failed to start");
                // Dropping the unlaunched reservation frees the slot first.
                drop(reservation);
                let _ = tx.send(Err(failure));
                return ProcessHandle {
                    job_id,
                    pid: None,
                    result: rx,
                };
            }
        };

        let pid = child.id();
        reservation.launched = true;
        let generation = reservation.generation;
        if let Some(mut entry) = self.live.get_mut(&job_id)
            && entry.generation == generation
        {
            entry.pid = pid;
            entry.started_at = Instant::now();
        }
        info!(job_id = %job_id, stage = %spec.stage, program = %spec.program, pid = ?pid, "Worker started");

        let ctx = runner::RunContext {
            store: self.store.clone(),
            classifier: self.classifier.clone(),
            job_id: job_id.clone(),
            baseline,
            stderr_tail_lines: self.config.stderr_tail_lines,
            drain_grace: Duration::from_millis(self.config.drain_grace_ms),
            cancel: reservation.cancel.clone(),
            shutdown: self.shutdown.clone(),
        };
        let live = self.live.clone();
        let task_job_id = job_id.clone();

        tokio::spawn(async move {
            let result = runner::run(ctx, spec, child).await;
            live.remove_if(&task_job_id, |_, p| p.generation == generation);
            match &result {
                Ok(outcome) => debug!(
                    job_id = %task_job_id,
                    duration_ms = outcome.duration.as_millis() as u64,
                    "Worker finished"
                ),
                Err(failure) => debug!(job_id = %task_job_id, error = %failure, "Worker failed"),
            }
            let _ = tx.send(result);
        });

        ProcessHandle {
            job_id,
            pid,
            result: rx,
        }
    }

    /// Kill the live process of `job_id`, if any. Returns whether one existed.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.live.get(job_id) {
            Some(process) => {
                process.cancel.cancel();
                info!(job_id = %job_id, pid = ?process.pid, "Cancelling worker");
                true
            }
            None => false,
        }
    }

    pub fn is_live(&self, job_id: &str) -> bool {
        self.live.contains_key(job_id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn pid(&self, job_id: &str) -> Option<u32> {
        self.live.get(job_id).and_then(|p| p.pid)
    }

    /// How long the live process of `job_id` has been running.
    pub fn running_for(&self, job_id: &str) -> Option<Duration> {
        self.live.get(job_id).map(|p| p.started_at.elapsed())
    }

    /// Kill every live worker and wait up to `grace` for their tasks to
    /// release their slots.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let deadline = Instant::now() + grace;
        while !self.live.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !self.live.is_empty() {
            warn!(remaining = self.live.len(), "Workers still registered after shutdown grace");
        }
    }
}

/// Path of the work directory for `job_id` under `root`.
pub fn job_work_dir(root: &Path, job_id: &str) -> PathBuf {
    root.join(job_id)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::domain::{JobKind, LogLevel, NewJob, StageKind};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        store: Arc<JobStore>,
        supervisor: Supervisor,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("sup.db").display());
        let db = Database::connect(&url).await.unwrap();
        let store = Arc::new(JobStore::new(&db));
        let root = dir.path().join("work");
        let supervisor = Supervisor::new(
            store.clone(),
            Arc::new(Classifier::default()),
            SupervisorConfig {
                work_dir: root.clone(),
                drain_grace_ms: 500,
                ..Default::default()
            },
        );
        Fixture {
            _dir: dir,
            root,
            store,
            supervisor,
        }
    }

    async fn job(store: &JobStore) -> String {
        let (job, _) = store
            .create_job(
                &NewJob {
                    title: "t".to_string(),
                    kind: JobKind::ScriptOnly,
                    owner_id: "o".to_string(),
                    payload: serde_json::json!({}),
                    priority: 0,
                },
                None,
                None,
            )
            .await
            .unwrap();
        job.id
    }

    fn sh(root: &Path, job_id: &str, script: &str, timeout: Duration) -> WorkerSpec {
        WorkerSpec {
            stage: StageKind::Script,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            work_dir: job_work_dir(root, job_id),
            timeout,
            artifact: None,
        }
    }

    #[tokio::test]
    async fn streams_output_and_reports_progress() {
        let f = fixture().await;
        let job_id = job(&f.store).await;
        let spec = sh(
            &f.root,
            &job_id,
            "echo 'Downloading media'; echo 'TTS chunk 1' >&2; echo '' ; echo 'ok'",
            Duration::from_secs(10),
        );

        let handle = f.supervisor.start(&job_id, spec, 0).unwrap();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(!f.supervisor.is_live(&job_id));

        let logs = f.store.list_logs(&job_id).await.unwrap();
        assert_eq!(logs.len(), 3);
        let job = f.store.require_job(&job_id).await.unwrap();
        assert_eq!(job.progress, 60);
        assert_eq!(job.step, "voice synthesis");
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_live() {
        let f = fixture().await;
        let job_id = job(&f.store).await;

        let handle = f
            .supervisor
            .start(&job_id, sh(&f.root, &job_id, "sleep 1", Duration::from_secs(10)), 0)
            .unwrap();
        let second = f
            .supervisor
            .start(&job_id, sh(&f.root, &job_id, "true", Duration::from_secs(10)), 0);
        assert!(matches!(second, Err(Error::AlreadyRunning { .. })));
        assert_eq!(f.supervisor.live_count(), 1);
        assert!(f.supervisor.running_for(&job_id).is_some());

        handle.wait().await.unwrap();
        assert_eq!(f.supervisor.live_count(), 0);
        assert!(f.supervisor.running_for(&job_id).is_none());
    }

    #[tokio::test]
    async fn dropped_reservation_frees_slot() {
        let f = fixture().await;
        let reservation = f.supervisor.reserve("job-x").unwrap();
        assert!(f.supervisor.reserve("job-x").is_err());
        drop(reservation);
        assert!(f.supervisor.reserve("job-x").is_ok());
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr_tail() {
        let f = fixture().await;
        let job_id = job(&f.store).await;
        let spec = sh(
            &f.root,
            &job_id,
            "echo 'ENOENT: no such file or directory' >&2; exit 1",
            Duration::from_secs(10),
        );

        let failure = f.supervisor.start(&job_id, spec, 0).unwrap().wait().await.unwrap_err();
        match failure {
            WorkerFailure::ProcessExit {
                code, stderr_tail, ..
            } => {
                assert_eq!(code, Some(1));
                assert!(stderr_tail.contains("ENOENT"));
            }
            other => panic!("unexpected failure: {other:?}"),
        }

        let logs = f.store.list_logs(&job_id).await.unwrap();
        assert_eq!(logs[0].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn timeout_kills_the_worker() {
        let f = fixture().await;
        let job_id = job(&f.store).await;
        let started = Instant::now();
        let spec = sh(&f.root, &job_id, "exec sleep 30", Duration::from_millis(300));

        let failure = f.supervisor.start(&job_id, spec, 0).unwrap().wait().await.unwrap_err();
        assert!(matches!(failure, WorkerFailure::Timeout(_)));
        assert!(failure.to_string().contains("timeout"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancel_kills_live_worker_and_is_noop_otherwise() {
        let f = fixture().await;
        let job_id = job(&f.store).await;
        assert!(!f.supervisor.cancel(&job_id));

        let handle = f
            .supervisor
            .start(&job_id, sh(&f.root, &job_id, "exec sleep 30", Duration::from_secs(60)), 0)
            .unwrap();
        assert!(handle.pid().is_some());
        assert!(f.supervisor.cancel(&job_id));

        let failure = handle.wait().await.unwrap_err();
        assert!(matches!(failure, WorkerFailure::Cancelled));
        assert!(!f.supervisor.cancel(&job_id));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_failure() {
        let f = fixture().await;
        let job_id = job(&f.store).await;
        let mut spec = sh(&f.root, &job_id, "", Duration::from_secs(5));
        spec.program = "/nonexistent/reelsmith-worker".to_string();

        let failure = f.supervisor.start(&job_id, spec, 0).unwrap().wait().await.unwrap_err();
        assert!(matches!(failure, WorkerFailure::Spawn { .. }));
        assert!(!f.supervisor.is_live(&job_id));
    }

    #[tokio::test]
    async fn successful_exit_without_artifact_fails() {
        let f = fixture().await;
        let job_id = job(&f.store).await;
        let mut spec = sh(&f.root, &job_id, "echo done", Duration::from_secs(5));
        spec.artifact = Some(ArtifactSpec::file("script.json"));

        let failure = f.supervisor.start(&job_id, spec, 0).unwrap().wait().await.unwrap_err();
        assert!(matches!(failure, WorkerFailure::ArtifactNotFound { .. }));
    }

    #[tokio::test]
    async fn shutdown_interrupts_live_workers() {
        let f = fixture().await;
        let job_id = job(&f.store).await;
        let handle = f
            .supervisor
            .start(&job_id, sh(&f.root, &job_id, "exec sleep 30", Duration::from_secs(60)), 0)
            .unwrap();

        f.supervisor.shutdown(Duration::from_secs(5)).await;
        assert_eq!(f.supervisor.live_count(), 0);
        assert!(matches!(handle.wait().await, Err(WorkerFailure::Interrupted)));
    }
}
