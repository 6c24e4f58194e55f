//! reelsmith library crate.
//!
//! Supervised job and pipeline orchestration for external content-generation
//! workers. [`service::Orchestrator`] is the entry point.

pub mod classifier;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod recovery;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod utils;

pub use error::{Error, Result, WorkerFailure};
pub use service::{Orchestrator, SubmitRequest};
