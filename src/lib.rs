//! Scheduler and driver for long-running IO benchmark workloads.
//!
//! Launches benchmark tools (s3bench, warp) as supervised OS processes on a
//! time-ordered schedule, runs periodic maintenance tasks alongside them,
//! classifies per-operation pass/fail from each tool's report or console
//! log, and aborts the whole run on the first failing workload.

pub mod config;
pub mod controller;
pub mod drivers;
pub mod maintenance;
pub mod registry;
pub mod scheduler;
pub mod supervisor;

use thiserror::Error;

pub use controller::{RunController, RunStatus};

#[derive(Error, Debug)]
pub enum RunError {
    #[error("configuration error")]
    Config(#[from] config::ConfigErrors),
    #[error(transparent)]
    Controller(#[from] controller::ControllerError),
    #[error("a run thread panicked")]
    WorkerPanic,
}
