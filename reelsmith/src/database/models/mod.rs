//! Row models. Enum columns are stored as their kebab-case strings.

pub mod job;
pub mod pipeline;
pub mod recovery;

pub use job::{JobDbModel, JobLogDbModel};
pub use pipeline::{PipelineDbModel, StageDbModel};
pub use recovery::{BatchItemDbModel, RetryRecordDbModel, SettingDbModel};
