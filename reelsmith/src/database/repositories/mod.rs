//! Repository traits and their SQLx implementations.
//!
//! Reads use the shared read pool; every write goes through the serialized
//! write pool and is retried on `SQLITE_BUSY`.

pub mod job;
pub mod pipeline;
pub mod recovery;
pub mod settings;

pub use job::{JobCount, JobRepository, SqlxJobRepository};
pub use pipeline::{PipelineRepository, SqlxPipelineRepository, StageChange};
pub use recovery::{
    BatchItemRepository, RetryRecordRepository, SqlxBatchItemRepository,
    SqlxRetryRecordRepository,
};
pub use settings::{SettingsRepository, SqlxSettingsRepository};
