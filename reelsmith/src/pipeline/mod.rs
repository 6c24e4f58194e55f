//! Pipeline state machine.
//!
//! A job owns an ordered list of stages. The poller claims ready stages,
//! the executor runs them through the supervisor, and stage outcomes move
//! the job forward or hand it to the recovery manager.

mod batch;
mod executor;
mod manager;
mod poller;
pub mod state;

pub use batch::{BatchPolicy, items_from_payload};
pub use executor::StageExecutor;
pub use manager::PipelineManager;
pub use poller::{PollerConfig, StagePoller};
