//! The task that owns one worker process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use process_utils::{ExitSummary, LineTail};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::artifact;
use super::spec::WorkerSpec;
use super::{RunOutcome, RunResult};
use crate::classifier::{Classifier, ProgressTracker};
use crate::domain::LogStream;
use crate::error::WorkerFailure;
use crate::store::JobStore;

const LINE_CHANNEL_CAPACITY: usize = 256;

struct OutputLine {
    stream: LogStream,
    line: String,
}

pub(super) struct RunContext {
    pub store: Arc<JobStore>,
    pub classifier: Arc<Classifier>,
    pub job_id: String,
    pub baseline: u8,
    pub stderr_tail_lines: usize,
    pub drain_grace: Duration,
    pub cancel: CancellationToken,
    pub shutdown: CancellationToken,
}

enum Ended {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
    Interrupted,
}

pub(super) fn build_command(spec: &WorkerSpec, job_id: &str) -> tokio::process::Command {
    let mut cmd = process_utils::worker_command(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.work_dir)
        .env("REELSMITH_JOB_ID", job_id)
        .env("REELSMITH_STAGE", spec.stage.as_str())
        .env("REELSMITH_WORK_DIR", &spec.work_dir)
        .env("PYTHONUNBUFFERED", "1")
        .env("PYTHONIOENCODING", "utf-8")
        .envs(&spec.env);
    cmd
}

/// Drive `child` to completion and turn its fate into a [`RunResult`].
pub(super) async fn run(ctx: RunContext, spec: WorkerSpec, mut child: Child) -> RunResult {
    let started = Instant::now();
    let job_id = ctx.job_id.clone();

    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, LogStream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, LogStream::Stderr, tx.clone()));
    }
    drop(tx);

    let consumer = tokio::spawn(consume(
        rx,
        ctx.store.clone(),
        ctx.classifier.clone(),
        job_id.clone(),
        ctx.baseline,
        ctx.stderr_tail_lines,
    ));

    let ended = tokio::select! {
        status = child.wait() => Ended::Exited(status),
        _ = tokio::time::sleep(spec.timeout) => Ended::TimedOut,
        _ = ctx.cancel.cancelled() => Ended::Cancelled,
        _ = ctx.shutdown.cancelled() => Ended::Interrupted,
    };

    if !matches!(ended, Ended::Exited(_)) {
        if let Err(e) = child.kill().await {
            warn!(job_id = %job_id, error = %e, "Failed to kill worker");
        }
    }

    let tail = drain(consumer, readers, ctx.drain_grace, &job_id).await;

    let status = match ended {
        Ended::Exited(status) => status,
        Ended::TimedOut => {
            warn!(job_id = %job_id, timeout_secs = spec.timeout.as_secs(), "Worker timed out and was killed");
            return Err(WorkerFailure::Timeout(spec.timeout));
        }
        Ended::Cancelled => {
            info!(job_id = %job_id, "Worker killed on cancellation");
            return Err(WorkerFailure::Cancelled);
        }
        Ended::Interrupted => {
            info!(job_id = %job_id, "Worker killed on shutdown");
            return Err(WorkerFailure::Interrupted);
        }
    };

    let status = status
        .map_err(|e| WorkerFailure::TransientInfra(format!("failed to wait for worker: {e}")))?;
    let exit = ExitSummary::from_status(&status);
    if !exit.is_success() {
        return Err(WorkerFailure::ProcessExit {
            code: exit.code(),
            exit: exit.to_string(),
            stderr_tail: if tail.is_empty() {
                "no stderr output".to_string()
            } else {
                tail.joined()
            },
        });
    }

    let artifact = match &spec.artifact {
        Some(artifact_spec) => Some(artifact::verify(artifact_spec, &spec.work_dir).await?),
        None => None,
    };

    Ok(RunOutcome {
        exit_code: exit.code().unwrap_or_default(),
        artifact,
        duration: started.elapsed(),
    })
}

fn spawn_reader<R>(reader: R, stream: LogStream, tx: mpsc::Sender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Workers may print invalid UTF-8; keep the line anyway.
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(OutputLine { stream, line }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(%stream, error = %e, "Worker stream read failed");
                    break;
                }
            }
        }
    })
}

/// Single consumer, so sequence numbers follow arrival order.
async fn consume(
    mut rx: mpsc::Receiver<OutputLine>,
    store: Arc<JobStore>,
    classifier: Arc<Classifier>,
    job_id: String,
    baseline: u8,
    tail_lines: usize,
) -> LineTail {
    let mut tracker = ProgressTracker::new(baseline);
    let mut tail = LineTail::new(tail_lines);

    while let Some(OutputLine { stream, line }) = rx.recv().await {
        if stream == LogStream::Stderr {
            tail.push(&line);
        }
        let Some(classified) = classifier.classify(&line, stream) else {
            continue;
        };
        trace!(job_id = %job_id, %stream, "{}", classified.entry.message);

        if let Err(e) = store.append_log(&job_id, &classified.entry).await {
            warn!(job_id = %job_id, error = %e, "Failed to append worker output");
        }
        if let Some(hint) = classified.hint
            && let Some(progress) = tracker.observe(&hint)
            && let Err(e) = store.advance_progress(&job_id, progress, &hint.step).await
        {
            warn!(job_id = %job_id, error = %e, "Failed to record progress");
        }
    }
    tail
}

/// Wait for buffered output to be persisted. Pipes inherited by grandchildren
/// can stay open after the worker dies, so readers get `grace` to finish.
async fn drain(
    consumer: JoinHandle<LineTail>,
    readers: Vec<JoinHandle<()>>,
    grace: Duration,
    job_id: &str,
) -> LineTail {
    let abort_handles: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
    let mut consumer = consumer;

    match tokio::time::timeout(grace, &mut consumer).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            warn!(job_id = %job_id, error = %e, "Output consumer task failed");
            LineTail::new(0)
        }
        Err(_) => {
            debug!(job_id = %job_id, "Output still open after exit; closing readers");
            for handle in abort_handles {
                handle.abort();
            }
            match consumer.await {
                Ok(tail) => tail,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Output consumer task failed");
                    LineTail::new(0)
                }
            }
        }
    }
}
