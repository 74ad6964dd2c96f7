//! Supervision of external fuzzing engines.
//!
//! An [`Orchestrator`] owns one [`EngineAdapter`] per registered engine and the session registry
//! they share. Every session runs one fuzzer process, monitored by its own task until it exits,
//! times out or is stopped.

#[macro_use]
pub mod utils;
pub mod adapter;
pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod result;
pub mod session;
pub mod task;

pub use adapter::{EngineAdapter, SessionHandle};
pub use config::Config;
pub use engine::{Engine, EngineError};
pub use orchestrator::Orchestrator;
pub use result::{CoverageInfo, FuzzingResult, ReproductionResult, SessionStatus};
pub use task::FuzzingTask;
