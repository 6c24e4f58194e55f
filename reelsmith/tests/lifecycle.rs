//! Cancellation, log ordering and restart recovery.
#![cfg(unix)]

mod common;

use std::time::Duration;

use common::{Harness, sh, sh_with_artifact, workers};
use reelsmith::SubmitRequest;
use reelsmith::database::Database;
use reelsmith::domain::{
    JobKind, JobStatus, LogStream, RetryResult, RetryStrategy, StageKind, StageStatus,
};
use reelsmith::service::Orchestrator;
use reelsmith::supervisor::ArtifactSpec;
use tempfile::TempDir;

fn running(view: &reelsmith::service::JobStatusView) -> bool {
    view.job.status == JobStatus::Processing
        && view.stages.iter().any(|s| s.status == StageStatus::Running)
        && view.logs.iter().any(|l| l.message == "started")
}

#[tokio::test]
async fn cancel_kills_the_worker_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut config = Harness::config(&dir);
    config.workers = workers(vec![(
        StageKind::Script,
        sh("echo started; exec sleep 30"),
    )]);
    let h = Harness::start(dir, config).await;

    let id = h
        .orch
        .submit(SubmitRequest::new(JobKind::ScriptOnly, "long", "owner"))
        .await
        .unwrap();
    h.wait_for(&id, Duration::from_secs(10), running).await;

    let cancelled = h.orch.cancel(&id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let done = h
        .wait_for(&id, Duration::from_secs(10), |v| {
            v.stages[0].status == StageStatus::Failed
        })
        .await;
    assert_eq!(done.job.status, JobStatus::Cancelled);
    assert!(done.retries.is_empty());

    let again = h.orch.cancel(&id).await.unwrap();
    assert_eq!(again.status, JobStatus::Cancelled);
    assert_eq!(again.version, h.orch.get_status(&id).await.unwrap().job.version);

    // Never retried.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let later = h.orch.get_status(&id).await.unwrap();
    assert_eq!(later.job.status, JobStatus::Cancelled);
    assert_eq!(later.stages[0].status, StageStatus::Failed);

    h.orch.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_pending_job_prevents_its_start() {
    let dir = TempDir::new().unwrap();
    let mut config = Harness::config(&dir);
    config.workers = workers(vec![(StageKind::Script, sh("touch ran"))]);
    let h = Harness::start(dir, config).await;

    let run_at = chrono::Utc::now() + chrono::Duration::milliseconds(300);
    let id = h
        .orch
        .submit(SubmitRequest::new(JobKind::ScriptOnly, "later", "owner").with_run_at(run_at))
        .await
        .unwrap();
    h.orch.cancel(&id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    let view = h.orch.get_status(&id).await.unwrap();
    assert_eq!(view.job.status, JobStatus::Cancelled);
    assert!(!h.work_dir(&id).join("ran").exists());

    h.orch.shutdown().await;
}

#[tokio::test]
async fn log_entries_are_totally_ordered() {
    let dir = TempDir::new().unwrap();
    let mut config = Harness::config(&dir);
    config.workers = workers(vec![(
        StageKind::Script,
        sh_with_artifact(
            r#"i=1
while [ $i -le 40 ]; do
  echo "out $i"
  echo "err $i" >&2
  i=$((i + 1))
done
printf '{}' > script.json"#,
            ArtifactSpec::file("script.json"),
        ),
    )]);
    let h = Harness::start(dir, config).await;

    let id = h
        .orch
        .submit(SubmitRequest::new(JobKind::ScriptOnly, "chatty", "owner"))
        .await
        .unwrap();
    let done = h.wait_terminal(&id).await;
    assert_eq!(done.job.status, JobStatus::Completed, "{:?}", done.job.error);

    let sequences: Vec<i64> = done.logs.iter().map(|l| l.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1), "{sequences:?}");

    for stream in [LogStream::Stdout, LogStream::Stderr] {
        let numbers: Vec<u32> = done
            .logs
            .iter()
            .filter(|l| l.stream == stream)
            .filter_map(|l| l.message.split_whitespace().nth(1)?.parse().ok())
            .collect();
        assert_eq!(numbers, (1..=40).collect::<Vec<_>>(), "{stream:?}");
    }

    h.orch.shutdown().await;
}

#[tokio::test]
async fn restart_recovers_orphaned_stage() {
    let dir = TempDir::new().unwrap();

    // First orchestrator: the worker outlives it.
    let mut config = Harness::config(&dir);
    config.workers = workers(vec![(
        StageKind::Script,
        sh_with_artifact(
            r#"echo started
if [ -f second ]; then printf '{}' > script.json; exit 0; fi
touch second
exec sleep 30"#,
            ArtifactSpec::file("script.json"),
        ),
    )]);
    let first = Harness::start(dir, config.clone()).await;
    let id = first
        .orch
        .submit(SubmitRequest::new(JobKind::ScriptOnly, "survivor", "owner"))
        .await
        .unwrap();
    first.wait_for(&id, Duration::from_secs(10), running).await;
    first.orch.shutdown_with_grace(Duration::from_secs(5)).await;
    let Harness { dir, .. } = first;

    // Status is served from SQLite before anything starts.
    let db = Database::connect(&config.database_url).await.unwrap();
    let orch = Orchestrator::new(config, db).await.unwrap();
    let view = orch.get_status(&id).await.unwrap();
    assert_eq!(view.job.status, JobStatus::Processing);
    assert_eq!(view.stages[0].status, StageStatus::Running);

    orch.start().await.unwrap();
    let second = Harness { dir, orch };
    let done = second.wait_terminal(&id).await;

    assert_eq!(done.job.status, JobStatus::Completed, "{:?}", done.job.error);
    let history: Vec<_> = done
        .retries
        .iter()
        .map(|r| (r.attempt_number, r.strategy, r.result))
        .collect();
    assert_eq!(
        history,
        vec![
            (1, RetryStrategy::RestartComponent, RetryResult::Failed),
            (2, RetryStrategy::RestartComponent, RetryResult::Success),
        ]
    );

    second.orch.shutdown().await;
}

#[tokio::test]
async fn concurrent_jobs_run_independently() {
    let dir = TempDir::new().unwrap();
    let mut config = Harness::config(&dir);
    config.workers = workers(vec![(
        StageKind::Script,
        sh_with_artifact(
            r#"echo "{title}" > title.txt; sleep 0.2; printf '{}' > script.json"#,
            ArtifactSpec::file("script.json"),
        ),
    )]);
    let h = Harness::start(dir, config).await;

    let mut ids = Vec::new();
    for i in 0..4 {
        let id = h
            .orch
            .submit(SubmitRequest::new(JobKind::ScriptOnly, format!("job {i}"), "owner"))
            .await
            .unwrap();
        ids.push(id);
    }

    for (i, id) in ids.iter().enumerate() {
        let done = h.wait_terminal(id).await;
        assert_eq!(done.job.status, JobStatus::Completed, "{:?}", done.job.error);
        let title = std::fs::read_to_string(h.work_dir(id).join("title.txt")).unwrap();
        assert_eq!(title.trim(), format!("job {i}"));
    }

    let report = h.orch.health().await.unwrap();
    assert!(report.healthy);
    assert_eq!(report.live_processes, 0);

    h.orch.shutdown().await;
}
