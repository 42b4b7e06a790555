//! Run configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::queue::DEFAULT_PORT;

/// Whether a run starts from the manifest or resumes from its logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    #[default]
    Fresh,
    Resume,
}

/// Run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Manifest listing `<config> <expected_output>` pairs.
    pub manifest: PathBuf,

    /// Prefix of the run logs (`<prefix>_all.log`, ...).
    pub prefix: String,

    /// Fresh run or resume.
    pub mode: RunMode,

    /// KLIP reduction command or path.
    pub klip_path: String,

    /// Failures allowed per task before it is permanently FAILED.
    pub retry_limit: u32,

    /// Completed outputs per archive batch.
    pub compress_threshold: usize,

    /// Archive path prefix; batches are `<batch_root><N>.tar.gz`.
    pub batch_root: PathBuf,

    /// Bound on each wait for a finished task.
    pub wait_timeout: Duration,

    /// Emit a status line every this many wait cycles.
    pub status_every: u32,

    /// Dispatch queue settings.
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        let prefix = "run".to_string();
        Self {
            manifest: PathBuf::from("configList.list"),
            queue: QueueConfig::for_prefix(&prefix),
            prefix,
            mode: RunMode::Fresh,
            klip_path: "klipReduce".to_string(),
            retry_limit: 0,
            compress_threshold: 100,
            batch_root: PathBuf::from("batch"),
            wait_timeout: Duration::from_secs(5),
            status_every: 10,
        }
    }
}

/// Dispatch queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Address the listener binds to.
    pub bind_host: String,

    /// Port tried before falling back to an OS-assigned one.
    pub preferred_port: u16,

    /// Worker slots.
    pub workers: usize,

    /// Record per-task resource usage.
    pub monitor: bool,

    /// Directory holding per-task sandboxes.
    pub sandbox_root: PathBuf,
}

impl QueueConfig {
    /// Defaults with the sandbox placed next to the run logs.
    pub fn for_prefix(prefix: &str) -> Self {
        Self {
            sandbox_root: PathBuf::from(format!("{prefix}_sandbox")),
            ..Self::default()
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            preferred_port: DEFAULT_PORT,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            monitor: false,
            sandbox_root: PathBuf::from("run_sandbox"),
        }
    }
}
