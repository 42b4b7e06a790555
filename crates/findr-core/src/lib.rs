//! FINDR Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Async runtimes
//! - Network listeners
//! - The dispatch queue backend
//!
//! All types here describe the KLIP reduction run: task records, their
//! status, the external command they invoke and the manifest they come from.

pub mod command;
pub mod error;
pub mod ids;
pub mod manifest;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use command::ReduceCommand;
pub use error::CoreError;
pub use ids::{QueueTaskId, SessionId, TaskTag};
pub use manifest::{build_tasks, parse_manifest, read_manifest, ManifestEntry, ManifestError};
pub use status::{TaskStatus, WorkerStatus};
pub use task::{TaskRecord, TaskSet};
