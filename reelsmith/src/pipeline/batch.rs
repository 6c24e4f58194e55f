//! Partial-success policy for batch stages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::BatchSummary;

/// When a batch counts as a (possibly partial) success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    /// Minimum number of successful items.
    pub min_successes: usize,
    /// Optional minimum fraction of successful items, `0.0..=1.0`.
    pub min_ratio: Option<f64>,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            min_successes: 1,
            min_ratio: None,
        }
    }
}

impl BatchPolicy {
    pub fn is_satisfied(&self, summary: &BatchSummary) -> bool {
        if summary.total == 0 || summary.succeeded < self.min_successes {
            return false;
        }
        match self.min_ratio {
            Some(ratio) => summary.succeeded as f64 / summary.total as f64 >= ratio,
            None => true,
        }
    }

    /// Note stored on the job for a satisfied batch.
    pub fn completion_note(summary: &BatchSummary) -> String {
        if summary.failed == 0 {
            summary.describe()
        } else {
            format!("partial: {}", summary.describe())
        }
    }
}

/// Batch items from a job payload (`payload.items`).
///
/// `None` when the payload does not describe a batch.
pub fn items_from_payload(payload: &Value) -> Option<Vec<String>> {
    let items = payload.get("items")?.as_array()?;
    Some(
        items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
    )
}
