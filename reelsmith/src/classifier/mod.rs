//! Worker output classification.
//!
//! Turns raw stdout/stderr lines into log entries with a severity and an
//! optional progress hint. Classification never changes job status; only
//! the process exit status and artifact verification do.

mod rules;

pub use rules::{Matcher, ProgressHint, ProgressRule, RuleConfig, RuleSet};

use crate::domain::{LogLevel, LogStream, NewLogEntry};

const ERROR_MARKERS: &[&str] = &[
    "error",
    "traceback",
    "exception",
    "fatal",
    "failed",
    "enoent",
    "no such file",
];

const WARNING_MARKERS: &[&str] = &["warning", "warn:", "deprecated"];

/// Highest progress a running attempt may report.
pub const RUNNING_PROGRESS_CAP: u8 = 90;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub entry: NewLogEntry,
    pub hint: Option<ProgressHint>,
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    rules: RuleSet,
}

impl Classifier {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    /// Classify one line. Blank lines produce nothing.
    pub fn classify(&self, line: &str, stream: LogStream) -> Option<Classified> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }

        let lowered = line.to_lowercase();
        let level = if ERROR_MARKERS.iter().any(|m| lowered.contains(m)) {
            LogLevel::Error
        } else if WARNING_MARKERS.iter().any(|m| lowered.contains(m)) {
            LogLevel::Warning
        } else {
            LogLevel::Info
        };

        Some(Classified {
            entry: NewLogEntry::new(level, stream, line),
            hint: self.rules.hint_for(line),
        })
    }
}

/// Per-attempt progress clamp.
///
/// Hints only ever raise progress and never go past [`RUNNING_PROGRESS_CAP`];
/// reaching 100 is reserved for a verified successful exit.
#[derive(Debug, Clone, Copy)]
pub struct ProgressTracker {
    current: u8,
    cap: u8,
}

impl ProgressTracker {
    pub fn new(baseline: u8) -> Self {
        Self {
            current: baseline.min(RUNNING_PROGRESS_CAP),
            cap: RUNNING_PROGRESS_CAP,
        }
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    /// Returns the new progress when the hint raises it.
    pub fn observe(&mut self, hint: &ProgressHint) -> Option<u8> {
        let next = hint.floor.min(self.cap);
        if next > self.current {
            self.current = next;
            Some(next)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_dropped() {
        let classifier = Classifier::default();
        assert!(classifier.classify("", LogStream::Stdout).is_none());
        assert!(classifier.classify("   \r\n", LogStream::Stderr).is_none());
    }

    #[test]
    fn error_markers_tag_error() {
        let classifier = Classifier::default();
        let out = classifier
            .classify("ENOENT: no such file or directory", LogStream::Stderr)
            .unwrap();
        assert_eq!(out.entry.level, LogLevel::Error);
        assert_eq!(out.entry.stream, LogStream::Stderr);

        let out = classifier
            .classify("Traceback (most recent call last):", LogStream::Stderr)
            .unwrap();
        assert_eq!(out.entry.level, LogLevel::Error);
    }

    #[test]
    fn stderr_progress_is_info() {
        let classifier = Classifier::default();
        let out = classifier
            .classify("Downloading media 1/3", LogStream::Stderr)
            .unwrap();
        assert_eq!(out.entry.level, LogLevel::Info);
        assert_eq!(out.hint.unwrap().floor, 45);
    }

    #[test]
    fn warnings_are_tagged() {
        let classifier = Classifier::default();
        let out = classifier
            .classify("UserWarning: deprecated option", LogStream::Stderr)
            .unwrap();
        assert_eq!(out.entry.level, LogLevel::Warning);
    }

    #[test]
    fn tracker_is_monotonic_and_capped() {
        let mut tracker = ProgressTracker::new(0);
        let hint = |floor| ProgressHint {
            step: "s".to_string(),
            floor,
        };

        assert_eq!(tracker.observe(&hint(60)), Some(60));
        assert_eq!(tracker.observe(&hint(45)), None);
        assert_eq!(tracker.observe(&hint(60)), None);
        assert_eq!(tracker.observe(&hint(99)), Some(90));
        assert_eq!(tracker.observe(&hint(100)), None);
        assert_eq!(tracker.current(), 90);
    }

    #[test]
    fn tracker_starts_at_baseline() {
        let mut tracker = ProgressTracker::new(45);
        let hint = ProgressHint {
            step: "s".to_string(),
            floor: 30,
        };
        assert_eq!(tracker.observe(&hint), None);
        assert_eq!(tracker.current(), 45);
    }
}
