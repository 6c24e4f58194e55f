//! Failure taxonomy.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::policy::RecoveryConfig;
use crate::error::WorkerFailure;

/// What the recovery manager does with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    /// Retry with backoff.
    Transient,
    /// Fail the job; needs an operator.
    Permanent,
    /// The caller asked for it. Never retried.
    Cancelled,
    /// The orchestrator is shutting down; the stage is recovered on restart.
    Interrupted,
}

static HTTP_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:http\w*|status(?: code)?|error)[\s:=/]*(?:1\.[01]\s+)?([1-5]\d\d)\b")
        .unwrap()
});

const PERMANENT_MARKERS: &[&str] = &[
    "invalid credentials",
    "invalid api key",
    "unauthorized",
    "forbidden",
    "authentication failed",
    "malformed",
    "invalid input",
    "validation error",
    "quota exceeded",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection lost",
    "temporarily unavailable",
    "network is unreachable",
    "rate limit",
];

fn http_status(text: &str) -> Option<u16> {
    HTTP_STATUS
        .captures_iter(text)
        .filter_map(|c| c[1].parse().ok())
        .last()
}

/// Classify free-form failure text; `None` when nothing decisive is found.
fn classify_text(text: &str) -> Option<FailureClass> {
    if let Some(status) = http_status(text) {
        match status {
            400 | 401 | 403 | 404 | 422 => return Some(FailureClass::Permanent),
            408 | 429 | 500..=599 => return Some(FailureClass::Transient),
            _ => {}
        }
    }
    let lowered = text.to_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Some(FailureClass::Permanent);
    }
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Some(FailureClass::Transient);
    }
    None
}

pub fn classify(failure: &WorkerFailure, config: &RecoveryConfig) -> FailureClass {
    match failure {
        WorkerFailure::Cancelled => FailureClass::Cancelled,
        WorkerFailure::Interrupted => FailureClass::Interrupted,
        WorkerFailure::Timeout(_) if config.retry_on_timeout => FailureClass::Transient,
        WorkerFailure::Timeout(_) => FailureClass::Permanent,
        WorkerFailure::TransientInfra(_) => FailureClass::Transient,
        WorkerFailure::PermanentInput(_)
        | WorkerFailure::ArtifactNotFound { .. }
        | WorkerFailure::MalformedArtifact { .. }
        | WorkerFailure::BatchBelowThreshold { .. } => FailureClass::Permanent,
        WorkerFailure::Spawn { source, .. } => match source.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                FailureClass::Permanent
            }
            _ => FailureClass::Transient,
        },
        WorkerFailure::ProcessExit {
            code, stderr_tail, ..
        } => {
            if code.is_some_and(|c| config.permanent_exit_codes.contains(&c)) {
                return FailureClass::Permanent;
            }
            // Unknown crashes (ENOENT, tracebacks) get the benefit of the doubt.
            classify_text(stderr_tail).unwrap_or(FailureClass::Transient)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn exit(code: i32, stderr: &str) -> WorkerFailure {
        WorkerFailure::ProcessExit {
            code: Some(code),
            exit: format!("exit code {code}"),
            stderr_tail: stderr.to_string(),
        }
    }

    #[test]
    fn enoent_crash_is_transient() {
        let config = RecoveryConfig::default();
        assert_eq!(
            classify(&exit(1, "Error: ENOENT: no such file or directory"), &config),
            FailureClass::Transient
        );
    }

    #[test]
    fn http_statuses() {
        let config = RecoveryConfig::default();
        assert_eq!(
            classify(&exit(1, "requests.exceptions.HTTPError: 404 Client Error"), &config),
            FailureClass::Permanent,
        );
        assert_eq!(
            classify(&exit(1, "upload failed: HTTP 401 Unauthorized"), &config),
            FailureClass::Permanent
        );
        assert_eq!(
            classify(&exit(1, "server said status code: 503"), &config),
            FailureClass::Transient
        );
        assert_eq!(
            classify(&exit(1, "HTTP/1.1 429 Too Many Requests"), &config),
            FailureClass::Transient
        );
        assert_eq!(
            classify(&exit(1, "error 422 from API"), &config),
            FailureClass::Permanent
        );
    }

    #[test]
    fn credential_markers_are_permanent() {
        let config = RecoveryConfig::default();
        assert_eq!(
            classify(&exit(1, "openai.AuthenticationError: Invalid API key"), &config),
            FailureClass::Permanent
        );
    }

    #[test]
    fn configured_exit_codes_are_permanent() {
        let config = RecoveryConfig::default();
        assert_eq!(classify(&exit(2, "usage: script.py"), &config), FailureClass::Permanent);
    }

    #[test]
    fn timeout_is_permanent_unless_configured() {
        let failure = WorkerFailure::Timeout(Duration::from_secs(1));
        assert_eq!(
            classify(&failure, &RecoveryConfig::default()),
            FailureClass::Permanent
        );
        let config = RecoveryConfig {
            retry_on_timeout: true,
            ..Default::default()
        };
        assert_eq!(classify(&failure, &config), FailureClass::Transient);
    }

    #[test]
    fn structural_failures() {
        let config = RecoveryConfig::default();
        assert_eq!(
            classify(
                &WorkerFailure::ArtifactNotFound {
                    expected: "x".to_string()
                },
                &config
            ),
            FailureClass::Permanent
        );
        assert_eq!(
            classify(
                &WorkerFailure::MalformedArtifact {
                    path: PathBuf::from("x"),
                    reason: "bad".to_string()
                },
                &config
            ),
            FailureClass::Permanent
        );
        assert_eq!(
            classify(
                &WorkerFailure::Spawn {
                    program: "python3".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                },
                &config
            ),
            FailureClass::Permanent
        );
        assert_eq!(classify(&WorkerFailure::Cancelled, &config), FailureClass::Cancelled);
        assert_eq!(
            classify(&WorkerFailure::Interrupted, &config),
            FailureClass::Interrupted
        );
    }
}
