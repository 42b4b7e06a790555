//! FINDR Control Plane Library
//!
//! This crate drives a KLIP reduction run: it keeps the durable run logs,
//! feeds tasks to a dispatch queue, reconciles finished tasks and compacts
//! completed outputs into numbered archives.

pub mod archive;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod queue;
pub mod reconcile;
pub mod run_state;
pub mod runner;
pub mod state;
pub mod status;

pub use archive::{ArchiveCompactor, BatchReport};
pub use config::{Config, QueueConfig, RunMode};
pub use error::RunError;
pub use queue::{DispatchQueue, LocalWorkQueue};
pub use run_state::{RunPaths, RunStateStore};
pub use runner::{prepare, run, PreparedRun, RunSummary};
pub use status::{summarize_run, RunReport};
