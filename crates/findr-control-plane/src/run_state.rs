//! Durable run state: append-only, tab-separated log files.
//!
//! - `<prefix>_all.log`: `expected_output \t command`, one line per task
//! - `<prefix>_complete.log`: `expected_output \t tag`
//! - `<prefix>_failed.log`: `expected_output \t tag \t attempt_count`
//! - `<prefix>_usage.log`: header plus one row per returned task
//!
//! Every append writes a whole line and flushes before returning, so after a
//! crash the logs describe every event acknowledged before it.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use findr_core::TaskRecord;

use crate::config::RunMode;
use crate::queue::{FinishedTask, QueueStats};

/// Column names of the usage log.
pub const USAGE_HEADER: [&str; 22] = [
    "task_id",
    "command",
    "start",
    "end",
    "exit_status",
    "cpu_time",
    "wall_time",
    "cores",
    "virtual_memory",
    "swap_memory",
    "total_processes",
    "max_concurrent_processes",
    "bytes_read",
    "bytes_written",
    "workers_connected",
    "workers_busy",
    "workers_idle",
    "workers_removed",
    "tasks_complete",
    "tasks_running",
    "tasks_waiting",
    "total_execute_time",
];

/// Run-state errors.
#[derive(Debug, Error)]
pub enum RunStateError {
    #[error("Run logs already exist, refusing to overwrite: {}", display_paths(.paths))]
    AlreadyExists { paths: Vec<PathBuf> },

    #[error("Run logs missing, cannot resume: {}", display_paths(.paths))]
    MissingLog { paths: Vec<PathBuf> },

    #[error("Run log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Paths of the four run logs for a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub all: PathBuf,
    pub complete: PathBuf,
    pub failed: PathBuf,
    pub usage: PathBuf,
}

impl RunPaths {
    pub fn new(prefix: &str) -> Self {
        Self {
            all: PathBuf::from(format!("{prefix}_all.log")),
            complete: PathBuf::from(format!("{prefix}_complete.log")),
            failed: PathBuf::from(format!("{prefix}_failed.log")),
            usage: PathBuf::from(format!("{prefix}_usage.log")),
        }
    }

    /// Event log of the queue session.
    pub fn queue_log(prefix: &str) -> PathBuf {
        PathBuf::from(format!("{prefix}_queue.log"))
    }

    fn each(&self) -> [&PathBuf; 4] {
        [&self.all, &self.complete, &self.failed, &self.usage]
    }

    /// Logs that exist on disk.
    pub fn existing(&self) -> Vec<PathBuf> {
        self.each().into_iter().filter(|p| p.exists()).cloned().collect()
    }

    /// Logs absent from disk.
    pub fn missing(&self) -> Vec<PathBuf> {
        self.each().into_iter().filter(|p| !p.exists()).cloned().collect()
    }
}

/// One log file, written a line at a time.
struct LogFile {
    path: PathBuf,
    file: File,
}

impl LogFile {
    fn create_new(path: &Path) -> Result<Self, RunStateError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| match source.kind() {
                io::ErrorKind::AlreadyExists => RunStateError::AlreadyExists {
                    paths: vec![path.to_path_buf()],
                },
                _ => RunStateError::Io {
                    path: path.to_path_buf(),
                    source,
                },
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn append_existing(path: &Path) -> Result<Self, RunStateError> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|source| RunStateError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn append(&mut self, fields: &[&str]) -> Result<(), RunStateError> {
        let mut line = fields.join("\t");
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|source| RunStateError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// Create all four logs, recording each path once its file exists.
fn create_log_set(
    paths: &RunPaths,
    created: &mut Vec<PathBuf>,
) -> Result<(LogFile, LogFile, LogFile, LogFile), RunStateError> {
    let mut create = |path: &Path| -> Result<LogFile, RunStateError> {
        let log = LogFile::create_new(path)?;
        created.push(path.to_path_buf());
        Ok(log)
    };
    let all = create(&paths.all)?;
    let complete = create(&paths.complete)?;
    let failed = create(&paths.failed)?;
    let mut usage = create(&paths.usage)?;
    usage.append(&USAGE_HEADER)?;
    Ok((all, complete, failed, usage))
}

/// Writer for the run logs. The reconciler is its only writer for the
/// `complete` and `failed` logs.
pub struct RunStateStore {
    paths: RunPaths,
    mode: RunMode,
    all: LogFile,
    complete: LogFile,
    failed: LogFile,
    usage: LogFile,
    submitted: HashSet<PathBuf>,
}

impl RunStateStore {
    /// Create the logs for a new run. Fails if any of them already exists.
    pub fn open_for_fresh_run(prefix: &str) -> Result<Self, RunStateError> {
        let paths = RunPaths::new(prefix);
        let existing = paths.existing();
        if !existing.is_empty() {
            return Err(RunStateError::AlreadyExists { paths: existing });
        }

        let mut created = Vec::new();
        let (all, complete, failed, usage) = match create_log_set(&paths, &mut created) {
            Ok(logs) => logs,
            Err(e) => {
                // Remove only what this call created.
                for path in &created {
                    if let Err(remove) = fs::remove_file(path) {
                        warn!(path = %path.display(), error = %remove, "Failed to remove partial run log");
                    }
                }
                return Err(e);
            }
        };

        Ok(Self {
            all,
            complete,
            failed,
            usage,
            paths,
            mode: RunMode::Fresh,
            submitted: HashSet::new(),
        })
    }

    /// Reopen the logs of an earlier run for appending. Fails if any is missing.
    pub fn open_for_resume(prefix: &str) -> Result<Self, RunStateError> {
        let paths = RunPaths::new(prefix);
        let missing = paths.missing();
        if !missing.is_empty() {
            return Err(RunStateError::MissingLog { paths: missing });
        }

        Ok(Self {
            all: LogFile::append_existing(&paths.all)?,
            complete: LogFile::append_existing(&paths.complete)?,
            failed: LogFile::append_existing(&paths.failed)?,
            usage: LogFile::append_existing(&paths.usage)?,
            paths,
            mode: RunMode::Resume,
            submitted: HashSet::new(),
        })
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Add a task to the `all` log. Writes once per task and only on a fresh
    /// run; returns whether a line was written.
    pub fn record_submission(&mut self, task: &TaskRecord) -> Result<bool, RunStateError> {
        if self.mode == RunMode::Resume {
            return Ok(false);
        }
        if !self.submitted.insert(task.expected_output.clone()) {
            debug!(output = %task.output_key(), "Task already in all log");
            return Ok(false);
        }
        self.all
            .append(&[&task.output_key(), &task.command.to_string()])?;
        Ok(true)
    }

    pub fn record_completion(&mut self, task: &TaskRecord) -> Result<(), RunStateError> {
        self.complete.append(&[&task.output_key(), task.tag.as_str()])
    }

    pub fn record_failure(&mut self, task: &TaskRecord, attempt_count: u32) -> Result<(), RunStateError> {
        self.failed.append(&[
            &task.output_key(),
            task.tag.as_str(),
            &attempt_count.to_string(),
        ])
    }

    pub fn record_usage(&mut self, row: &UsageRow) -> Result<(), RunStateError> {
        let fields = row.fields();
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        self.usage.append(&refs)
    }
}

/// One row of the usage log.
#[derive(Debug, Clone)]
pub struct UsageRow {
    fields: Vec<String>,
}

impl UsageRow {
    /// Build a row from a returned task and the queue counts at that time.
    /// Resource columns are zero when the queue does not monitor resources.
    pub fn new(task: &FinishedTask, command: &str, stats: &QueueStats) -> Self {
        let usage = task.resources.clone().unwrap_or_default();
        let exit_status = task
            .exit_status
            .map_or_else(|| "-".to_string(), |code| code.to_string());

        let fields = vec![
            task.id.to_string(),
            command.to_string(),
            task.started_at.to_rfc3339(),
            task.finished_at.to_rfc3339(),
            exit_status,
            format!("{:.3}", usage.cpu_time.as_secs_f64()),
            format!("{:.3}", usage.wall_time.as_secs_f64()),
            usage.cores.to_string(),
            usage.virtual_memory.to_string(),
            usage.swap_memory.to_string(),
            usage.total_processes.to_string(),
            usage.max_concurrent_processes.to_string(),
            usage.bytes_read.to_string(),
            usage.bytes_written.to_string(),
            stats.workers_connected.to_string(),
            stats.workers_busy.to_string(),
            stats.workers_idle.to_string(),
            stats.workers_removed.to_string(),
            stats.tasks_complete.to_string(),
            stats.tasks_running.to_string(),
            stats.tasks_waiting.to_string(),
            format!("{:.3}", stats.total_execute_time_ms as f64 / 1000.0),
        ];
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

/// A line of the `all` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedTask {
    pub expected_output: PathBuf,
    pub command: String,
}

/// State replayed from an earlier run's logs.
#[derive(Debug, Clone, Default)]
pub struct ExistingState {
    /// Every task of the run, in log order.
    pub all: Vec<LoggedTask>,

    /// Outputs recorded as complete.
    pub complete: HashSet<PathBuf>,

    /// Highest recorded attempt count per failed output.
    pub failed_attempts: HashMap<PathBuf, u32>,
}

/// Replay the logs of a run.
///
/// Lines that do not have the expected shape (for instance a line torn by a
/// crash mid-write) are skipped with a warning.
pub fn load_existing_state(prefix: &str) -> Result<ExistingState, RunStateError> {
    let paths = RunPaths::new(prefix);
    let missing = paths.missing();
    if !missing.is_empty() {
        return Err(RunStateError::MissingLog { paths: missing });
    }
    let mut state = ExistingState::default();
    let mut seen = HashSet::new();

    for_each_line(&paths.all, |fields| match fields {
        [output, command, ..] => {
            if seen.insert(PathBuf::from(output)) {
                state.all.push(LoggedTask {
                    expected_output: PathBuf::from(output),
                    command: command.to_string(),
                });
            }
            true
        }
        _ => false,
    })?;

    for_each_line(&paths.complete, |fields| match fields {
        [output, _tag, ..] => {
            state.complete.insert(PathBuf::from(output));
            true
        }
        _ => false,
    })?;

    for_each_line(&paths.failed, |fields| match fields {
        [output, _tag, attempts] => match attempts.parse::<u32>() {
            Ok(attempts) => {
                let entry = state
                    .failed_attempts
                    .entry(PathBuf::from(output))
                    .or_insert(0);
                *entry = (*entry).max(attempts);
                true
            }
            Err(_) => false,
        },
        _ => false,
    })?;

    Ok(state)
}

fn for_each_line<F>(path: &Path, mut handle: F) -> Result<(), RunStateError>
where
    F: FnMut(&[&str]) -> bool,
{
    let file = File::open(path).map_err(|source| RunStateError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| RunStateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if !handle(&fields) {
            warn!(
                log = %path.display(),
                line = index + 1,
                content = %line,
                "Skipping unreadable run log line"
            );
        }
    }
    Ok(())
}
