//! Retry and recovery.
//!
//! Classifies worker failures as transient or permanent, schedules backoff
//! retries, records every attempt, recovers orphaned stages after a crash
//! and re-arms failed jobs on operator request.

mod classify;
mod manager;
mod policy;

pub use classify::{FailureClass, classify};
pub use manager::{Disposition, RecoveryManager};
pub use policy::{RecoveryConfig, RetryPolicy};
