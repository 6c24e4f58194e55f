//! Application-wide error types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("A worker process is already running for job {job_id}")]
    AlreadyRunning { job_id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Why a worker run did not produce a usable result.
///
/// Produced by the supervisor, consumed by the recovery manager which maps
/// each variant onto a [`crate::recovery::FailureClass`].
#[derive(Error, Debug)]
pub enum WorkerFailure {
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    #[error("permanent input error: {0}")]
    PermanentInput(String),

    #[error("worker exited with {exit}: {stderr_tail}")]
    ProcessExit {
        code: Option<i32>,
        exit: String,
        stderr_tail: String,
    },

    #[error("worker exited successfully but the expected artifact was not found ({expected})")]
    ArtifactNotFound { expected: String },

    #[error("artifact {} is not valid JSON: {reason}", path.display())]
    MalformedArtifact { path: PathBuf, reason: String },

    #[error("timeout: worker exceeded the {}s wall-clock limit and was killed", .0.as_secs())]
    Timeout(Duration),

    #[error("batch below success threshold: {succeeded}/{total} items succeeded")]
    BatchBelowThreshold { succeeded: usize, total: usize },

    #[error("cancelled")]
    Cancelled,

    #[error("interrupted by orchestrator shutdown")]
    Interrupted,

    #[error("failed to spawn worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl WorkerFailure {
    /// Single-line summary suitable for `Job.error`.
    pub fn summary(&self) -> String {
        let text = self.to_string();
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let first = lines.next().unwrap_or_default().to_string();
        match lines.last() {
            Some(last) if last != first => format!("{} ... {}", first, last.trim()),
            _ => first,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_mentions_timeout() {
        let failure = WorkerFailure::Timeout(Duration::from_secs(2));
        assert!(failure.to_string().contains("timeout"));
        assert!(failure.to_string().contains("2s"));
    }

    #[test]
    fn summary_collapses_multiline_stderr() {
        let failure = WorkerFailure::ProcessExit {
            code: Some(1),
            exit: "exit code 1".to_string(),
            stderr_tail: "Traceback (most recent call last):\n  File \"x.py\"\nENOENT: no such file".to_string(),
        };
        let summary = failure.summary();
        assert!(!summary.contains('\n'));
        assert!(summary.starts_with("worker exited with exit code 1"));
        assert!(summary.ends_with("ENOENT: no such file"));
    }

    #[test]
    fn not_found_formats_entity() {
        let err = Error::not_found("Job", "abc");
        assert_eq!(err.to_string(), "Entity not found: Job with id abc");
    }
}
