//! Run driver: builds the task set, feeds the dispatch queue and reconciles
//! what comes back until the queue drains.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use findr_core::{build_tasks, read_manifest, CoreError, TaskSet, TaskStatus};

use crate::archive::{ArchiveCompactor, BatchReport};
use crate::config::{Config, RunMode};
use crate::error::RunError;
use crate::queue::{DispatchQueue, LocalWorkQueue, TaskSpec};
use crate::reconcile::Reconciler;
use crate::run_state::{load_existing_state, RunPaths, RunStateStore};
use crate::status::{format_elapsed, StatusReporter};

/// Totals of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub submitted: usize,
    pub complete: usize,
    pub failed: usize,
    /// Failed within the retry limit; a resume submits them again.
    pub waiting: usize,
    pub batches: Vec<BatchReport>,
    pub elapsed: Duration,
}

/// A run whose preconditions all hold: logs opened, tasks built, archive
/// numbering known. No queue exists yet.
pub struct PreparedRun {
    tasks: TaskSet,
    store: RunStateStore,
    compactor: ArchiveCompactor,
    reconciler: Reconciler,
    wait_timeout: Duration,
    status_every: u32,
}

/// Check every precondition and load the task set.
pub fn prepare(config: &Config) -> Result<PreparedRun, RunError> {
    let (tasks, store) = match config.mode {
        RunMode::Fresh => prepare_fresh(config)?,
        RunMode::Resume => prepare_resume(config)?,
    };

    let mut compactor = ArchiveCompactor::open(&config.batch_root, config.compress_threshold)?;
    if config.mode == RunMode::Resume {
        // Outputs completed before a crash but never archived.
        for record in tasks.iter() {
            if record.status == TaskStatus::Complete && record.expected_output.is_file() {
                compactor.add(&record.expected_output);
            }
        }
        if !compactor.pending().is_empty() {
            info!(
                files = compactor.pending().len(),
                "Completed outputs from earlier session queued for archival"
            );
        }
    }

    Ok(PreparedRun {
        tasks,
        store,
        compactor,
        reconciler: Reconciler::new(config.retry_limit),
        wait_timeout: config.wait_timeout,
        status_every: config.status_every,
    })
}

fn prepare_fresh(config: &Config) -> Result<(TaskSet, RunStateStore), RunError> {
    let entries = read_manifest(&config.manifest)?;
    let tasks = build_tasks(&entries, &config.klip_path)?;
    let mut store = RunStateStore::open_for_fresh_run(&config.prefix)?;

    for record in tasks.iter() {
        store.record_submission(record)?;
    }
    info!(
        manifest = %config.manifest.display(),
        tasks = tasks.len(),
        all_log = %store.paths().all.display(),
        "Read tasks from manifest"
    );
    Ok((tasks, store))
}

fn prepare_resume(config: &Config) -> Result<(TaskSet, RunStateStore), RunError> {
    let store = RunStateStore::open_for_resume(&config.prefix)?;
    let existing = load_existing_state(&config.prefix)?;

    let entries = read_manifest(&config.manifest)?;
    let from_manifest = build_tasks(&entries, &config.klip_path)?;

    // The all log decides which tasks belong to the run; the manifest
    // supplies their config paths.
    let mut tasks = TaskSet::new();
    for logged in &existing.all {
        let record = from_manifest
            .get(&logged.expected_output)
            .ok_or_else(|| RunError::NotInManifest {
                output: logged.expected_output.clone(),
                manifest: config.manifest.clone(),
            })?;
        if record.command.to_string() != logged.command {
            warn!(
                output = %logged.expected_output.display(),
                logged = %logged.command,
                current = %record.command,
                "Command differs from the one logged, using the current one"
            );
        }
        tasks.insert(record.clone())?;
    }

    let unlogged = from_manifest
        .iter()
        .filter(|r| tasks.get(&r.expected_output).is_none())
        .count();
    if unlogged > 0 {
        warn!(
            count = unlogged,
            "Manifest lists tasks that are not part of the run being resumed, ignoring them"
        );
    }

    tasks.restore_from_logs(&existing.complete, &existing.failed_attempts, config.retry_limit);
    info!(
        tasks = tasks.len(),
        complete = tasks.count(TaskStatus::Complete),
        failed = tasks.count(TaskStatus::Failed),
        retrying = tasks.count(TaskStatus::Waiting),
        "Resumed run state from logs"
    );
    Ok((tasks, store))
}

impl PreparedRun {
    /// Submit every outstanding task and reconcile results until the queue
    /// is empty, then archive what is left.
    pub async fn execute<Q: DispatchQueue>(mut self, queue: &mut Q) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let mut reporter = StatusReporter::new(self.status_every);
        let mut batches = Vec::new();

        let to_submit = self.tasks.submittable();
        info!(
            port = queue.port(),
            tasks = self.tasks.len(),
            to_submit = to_submit.len(),
            "Submitting tasks"
        );

        for output in &to_submit {
            let record = self
                .tasks
                .get_mut(output)
                .ok_or_else(|| CoreError::TaskNotFound(output.display().to_string()))?;
            let id = queue.submit(TaskSpec::for_record(record)?).await?;
            record.transition(TaskStatus::Submitted)?;
            debug!(task_id = %id, tag = %record.tag, "Submitted");
        }

        while !queue.is_empty() {
            if reporter.tick() {
                reporter.report(&queue.stats().await, &self.tasks);
            }

            let Some(finished) = queue.wait(self.wait_timeout).await? else {
                continue;
            };

            let stats = queue.stats().await;
            let outcome = self.reconciler.reconcile(
                &finished,
                &mut self.tasks,
                &mut self.store,
                &mut self.compactor,
                &stats,
            )?;
            reporter.task_finished(&outcome);

            if self.compactor.should_compact() {
                batches.extend(self.compactor.compact()?);
            }
        }

        batches.extend(self.compactor.finish()?);
        queue.shutdown().await;

        let summary = RunSummary {
            total: self.tasks.len(),
            submitted: to_submit.len(),
            complete: self.tasks.count(TaskStatus::Complete),
            failed: self.tasks.count(TaskStatus::Failed),
            waiting: self.tasks.count(TaskStatus::Waiting),
            batches,
            elapsed: started.elapsed(),
        };
        info!(
            submitted = summary.submitted,
            complete = summary.complete,
            failed = summary.failed,
            retry_eligible = summary.waiting,
            batches = summary.batches.len(),
            "Run finished in {}",
            format_elapsed(summary.elapsed)
        );
        Ok(summary)
    }
}

/// Prepare the run, start a local queue session and drive it to the end.
pub async fn run(config: &Config) -> Result<RunSummary, RunError> {
    let prepared = prepare(config)?;
    let mut queue =
        LocalWorkQueue::bind(&config.queue, &RunPaths::queue_log(&config.prefix)).await?;
    prepared.execute(&mut queue).await
}
