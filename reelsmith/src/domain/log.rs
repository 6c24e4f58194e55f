//! Job log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

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
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

/// Where a log line came from.
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
pub enum LogStream {
    Stdout,
    Stderr,
    /// Written by the orchestrator itself.
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

/// A log entry before it has been assigned a sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogEntry {
    pub message: String,
    pub level: LogLevel,
    pub stream: LogStream,
}

impl NewLogEntry {
    pub fn new(level: LogLevel, stream: LogStream, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level,
            stream,
        }
    }

    pub fn system(level: LogLevel, message: impl Into<String>) -> Self {
        Self::new(level, LogStream::System, message)
    }
}

/// Append-only, sequenced log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: String,
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
    pub stream: LogStream,
}
