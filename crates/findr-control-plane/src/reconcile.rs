//! Completion reconciliation.
//!
//! Turns each task handed back by the queue into a status change plus the
//! matching run-log writes, before the next task is looked at.

use std::path::PathBuf;

use tracing::{info, warn};

use findr_core::{TaskSet, TaskStatus};

use crate::archive::ArchiveCompactor;
use crate::error::RunError;
use crate::queue::{FinishedTask, QueueStats};
use crate::run_state::{RunStateStore, UsageRow};

/// What reconciling one finished task did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Exit status 0 and the expected output exists.
    Completed { output: PathBuf },

    /// Non-zero exit status, or the task never ran.
    Failed {
        output: PathBuf,
        attempts: u32,
        retry_eligible: bool,
    },

    /// Exit status 0 but nothing at the expected output path.
    MissingOutput {
        output: PathBuf,
        attempts: u32,
        retry_eligible: bool,
    },

    /// The task was not in flight; nothing recorded.
    Duplicate { output: PathBuf },

    /// The tag matches no task of this run.
    Unknown,
}

/// Applies finished tasks to the task set and the run logs.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    retry_limit: u32,
}

impl Reconciler {
    pub fn new(retry_limit: u32) -> Self {
        Self { retry_limit }
    }

    /// Reconcile one finished task. Every log write is flushed before this
    /// returns.
    pub fn reconcile(
        &self,
        finished: &FinishedTask,
        tasks: &mut TaskSet,
        store: &mut RunStateStore,
        compactor: &mut ArchiveCompactor,
        stats: &QueueStats,
    ) -> Result<Outcome, RunError> {
        let Some(record) = tasks.by_tag_mut(&finished.tag) else {
            warn!(task_id = %finished.id, tag = %finished.tag, "Finished task matches no task of this run");
            store.record_usage(&UsageRow::new(finished, finished.tag.as_str(), stats))?;
            return Ok(Outcome::Unknown);
        };

        store.record_usage(&UsageRow::new(finished, &record.command.to_string(), stats))?;
        let output = record.expected_output.clone();

        if record.status != TaskStatus::Submitted {
            warn!(
                task_id = %finished.id,
                output = %output.display(),
                status = %record.status,
                "Task returned while not in flight, ignoring"
            );
            return Ok(Outcome::Duplicate { output });
        }

        let missing_output = if finished.succeeded() {
            if output.exists() {
                record.transition(TaskStatus::Complete)?;
                store.record_completion(record)?;
                compactor.add(&output);
                info!(task_id = %finished.id, output = %output.display(), "Task complete");
                return Ok(Outcome::Completed { output });
            }
            warn!(
                task_id = %finished.id,
                output = %output.display(),
                "Task exited cleanly but its output is missing"
            );
            true
        } else {
            warn!(
                task_id = %finished.id,
                output = %output.display(),
                exit_status = ?finished.exit_status,
                error = finished.error.as_deref().unwrap_or(""),
                stderr = %finished.stderr,
                "Task failed"
            );
            false
        };

        let attempts = record.record_attempt_failure()?;
        store.record_failure(record, attempts)?;

        let retry_eligible = attempts <= self.retry_limit;
        if retry_eligible {
            record.transition(TaskStatus::Waiting)?;
            info!(
                output = %output.display(),
                attempts,
                retry_limit = self.retry_limit,
                "Task will be retried on resume"
            );
        }

        Ok(if missing_output {
            Outcome::MissingOutput {
                output,
                attempts,
                retry_eligible,
            }
        } else {
            Outcome::Failed {
                output,
                attempts,
                retry_eligible,
            }
        })
    }
}
