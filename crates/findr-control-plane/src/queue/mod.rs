//! Dispatch queue abstraction.
//!
//! The run driver only talks to a [`DispatchQueue`]: it submits one task per
//! task record, then polls with a bounded wait until the queue drains.
//! [`LocalWorkQueue`] is the backend shipped with FINDR.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use findr_core::command::file_name_of;
use findr_core::{CoreError, QueueTaskId, ReduceCommand, TaskRecord, TaskTag};

mod executor;
mod local;
mod log;

pub use local::LocalWorkQueue;

/// Port the queue tries first, before falling back to an OS-assigned one.
pub const DEFAULT_PORT: u16 = 9123;

/// Errors creating a queue session.
#[derive(Debug, Error)]
pub enum QueueInitError {
    #[error("Failed to bind queue listener on {host} (port {preferred} and fallback port 0): {source}")]
    Bind {
        host: String,
        preferred: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create sandbox directory {path}: {source}")]
    Sandbox {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open queue log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a live queue session.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Queue session is closed")]
    Closed,

    #[error("Queue stopped with {outstanding} task(s) outstanding")]
    Lost { outstanding: usize },

    #[error("Cannot build task for {output}: {source}")]
    InvalidTask {
        output: String,
        #[source]
        source: CoreError,
    },
}

/// A file moved between the control process and a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    /// Path on the control side.
    pub local: PathBuf,

    /// Name inside the worker's sandbox.
    pub remote_name: String,

    /// Whether workers may keep the file between tasks.
    pub cache: bool,
}

impl FileSpec {
    /// An uncached file staged under its basename.
    pub fn uncached(local: &Path) -> Result<Self, CoreError> {
        Ok(Self {
            local: local.to_path_buf(),
            remote_name: file_name_of(local)?,
            cache: false,
        })
    }
}

/// Everything a queue needs to run one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub command: ReduceCommand,
    pub tag: TaskTag,
    pub input: FileSpec,
    pub output: FileSpec,
}

impl TaskSpec {
    /// Build the task for a record: the config goes in uncached, the
    /// expected output comes back uncached.
    pub fn for_record(record: &TaskRecord) -> Result<Self, DispatchError> {
        let build = || -> Result<Self, CoreError> {
            Ok(Self {
                command: record.command.clone(),
                tag: record.tag.clone(),
                input: FileSpec::uncached(&record.config_path)?,
                output: FileSpec::uncached(&record.expected_output)?,
            })
        };
        build().map_err(|source| DispatchError::InvalidTask {
            output: record.output_key(),
            source,
        })
    }
}

/// Resource usage of one finished task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub cores: u32,
    pub virtual_memory: u64,
    pub swap_memory: u64,
    pub total_processes: u32,
    pub max_concurrent_processes: u32,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// A task handed back by [`DispatchQueue::wait`].
#[derive(Debug, Clone)]
pub struct FinishedTask {
    /// Session-local id.
    pub id: QueueTaskId,

    /// Tag given at submission.
    pub tag: TaskTag,

    /// Exit code of the command, `None` if it never ran or was killed.
    pub exit_status: Option<i32>,

    /// Why the task did not run cleanly, if known (staging, spawn, signal).
    pub error: Option<String>,

    /// Tail of the command's stderr.
    pub stderr: String,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Present when the queue monitors resources.
    pub resources: Option<ResourceUsage>,
}

impl FinishedTask {
    /// True if the command exited with status 0.
    pub fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Point-in-time worker and task counts of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub workers_connected: usize,
    pub workers_busy: usize,
    pub workers_idle: usize,
    /// Workers that left the pool. Local slots never leave, so
    /// [`LocalWorkQueue`] always reports 0.
    pub workers_removed: usize,
    pub tasks_submitted: u64,
    pub tasks_waiting: u64,
    pub tasks_running: u64,
    pub tasks_complete: u64,
    pub total_execute_time_ms: u64,
}

/// A master/worker task-dispatch service.
#[async_trait]
pub trait DispatchQueue: Send {
    /// Queue a task. Tasks are dispatched in submission order.
    async fn submit(&mut self, task: TaskSpec) -> Result<QueueTaskId, DispatchError>;

    /// Wait up to `timeout` for any task to finish. `Ok(None)` means the
    /// timeout passed; an error means outstanding tasks will never return.
    async fn wait(&mut self, timeout: Duration) -> Result<Option<FinishedTask>, DispatchError>;

    /// True when no submitted task is left to hand back.
    fn is_empty(&self) -> bool;

    /// Current worker and task counts.
    async fn stats(&self) -> QueueStats;

    /// Port the session listens on.
    fn port(&self) -> u16;

    /// Release the session's resources.
    async fn shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_spec_for_record() {
        let command = ReduceCommand::klip_reduce("klipReduce", Path::new("cfg/a.cfg")).unwrap();
        let record = TaskRecord::new("cfg/a.cfg", "out/a.fits", command);
        let spec = TaskSpec::for_record(&record).unwrap();

        assert_eq!(spec.tag.as_str(), "klipReduce -c a.cfg");
        assert_eq!(spec.input.local, PathBuf::from("cfg/a.cfg"));
        assert_eq!(spec.input.remote_name, "a.cfg");
        assert_eq!(spec.output.remote_name, "a.fits");
        assert!(!spec.input.cache && !spec.output.cache);
    }

    #[test]
    fn test_finished_task_success() {
        let now = Utc::now();
        let mut finished = FinishedTask {
            id: QueueTaskId::new(1),
            tag: TaskTag::new("x"),
            exit_status: Some(0),
            error: None,
            stderr: String::new(),
            started_at: now,
            finished_at: now,
            resources: None,
        };
        assert!(finished.succeeded());
        finished.exit_status = None;
        assert!(!finished.succeeded());
    }
}
