//! Per-item outcomes of batch stages.

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
pub enum BatchItemStatus {
    Succeeded,
    Failed,
}

impl BatchItemStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub job_id: String,
    /// 1-based position within the batch.
    pub item_index: u32,
    pub item: String,
    pub status: BatchItemStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregated view of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_items: Vec<u32>,
}

impl BatchSummary {
    pub fn from_items(items: &[BatchItem]) -> Self {
        let failed_items: Vec<u32> = items
            .iter()
            .filter(|i| i.status == BatchItemStatus::Failed)
            .map(|i| i.item_index)
            .collect();
        Self {
            total: items.len(),
            succeeded: items.len() - failed_items.len(),
            failed: failed_items.len(),
            failed_items,
        }
    }

    /// e.g. `8/10 items succeeded`.
    pub fn describe(&self) -> String {
        format!("{}/{} items succeeded", self.succeeded, self.total)
    }
}
