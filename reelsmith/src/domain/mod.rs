//! Domain entities shared by the store, the pipeline and recovery.

pub mod batch;
pub mod job;
pub mod log;
pub mod pipeline;
pub mod recovery;

pub use batch::{BatchItem, BatchItemStatus, BatchSummary};
pub use job::{Job, JobKind, JobPatch, JobStatus, NewJob};
pub use log::{LogEntry, LogLevel, LogStream, NewLogEntry};
pub use pipeline::{Pipeline, PipelineState, Stage, StageKind, StageStatus};
pub use recovery::{NewRetryRecord, RetryRecord, RetryResult, RetryStrategy};
