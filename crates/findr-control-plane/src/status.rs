//! Periodic progress reporting for the run driver.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use findr_core::{TaskSet, TaskStatus};

use crate::queue::QueueStats;
use crate::reconcile::Outcome;
use crate::run_state::{load_existing_state, ExistingState, RunStateError};

/// Emits a status line every `every` wait cycles and one line per finished
/// task.
#[derive(Debug)]
pub struct StatusReporter {
    every: u32,
    cycles: u64,
    started: Instant,
}

impl StatusReporter {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            cycles: 0,
            started: Instant::now(),
        }
    }

    /// Count a wait cycle; true when a status line is due.
    pub fn tick(&mut self) -> bool {
        self.cycles += 1;
        self.cycles % u64::from(self.every) == 0
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Log the periodic status line.
    pub fn report(&self, stats: &QueueStats, tasks: &TaskSet) {
        info!(
            workers_connected = stats.workers_connected,
            workers_busy = stats.workers_busy,
            workers_idle = stats.workers_idle,
            workers_lost = stats.workers_removed,
            "{}",
            format_status(stats, tasks, self.elapsed())
        );
    }

    /// Log the outcome of one finished task.
    pub fn task_finished(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Completed { output } => {
                info!(output = %output.display(), "Completed {}", output.display());
            }
            Outcome::Failed {
                output,
                attempts,
                retry_eligible,
            } => {
                info!(
                    output = %output.display(),
                    attempts,
                    retry_eligible,
                    "Failed {}",
                    output.display()
                );
            }
            Outcome::MissingOutput {
                output,
                attempts,
                retry_eligible,
            } => {
                info!(
                    output = %output.display(),
                    attempts,
                    retry_eligible,
                    "Failed {} (output missing)",
                    output.display()
                );
            }
            Outcome::Duplicate { output } => {
                warn!(output = %output.display(), "Ignored repeated result");
            }
            Outcome::Unknown => {}
        }
    }
}

/// `workers: C connected, B busy, I idle, L lost | tasks: ...`
pub fn format_status(stats: &QueueStats, tasks: &TaskSet, elapsed: Duration) -> String {
    format!(
        "workers: {} connected, {} busy, {} idle, {} lost | tasks: {} running, {} waiting, {} complete, {} failed | elapsed {}",
        stats.workers_connected,
        stats.workers_busy,
        stats.workers_idle,
        stats.workers_removed,
        stats.tasks_running,
        stats.tasks_waiting,
        tasks.count(TaskStatus::Complete),
        tasks.count(TaskStatus::Failed) + tasks.count(TaskStatus::Waiting),
        format_elapsed(elapsed)
    )
}

/// `HH:MM:SS`, hours unbounded.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Offline summary of a run, built from its logs alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub total: usize,
    pub complete: usize,
    /// Failed and out of retries.
    pub failed: usize,
    /// Failed within the retry limit; a resume submits them again.
    pub retry_eligible: usize,
    /// Never finished.
    pub pending: usize,
}

impl RunReport {
    pub fn from_state(state: &ExistingState, retry_limit: u32) -> Self {
        let mut report = Self {
            total: state.all.len(),
            ..Self::default()
        };
        for task in &state.all {
            if state.complete.contains(&task.expected_output) {
                report.complete += 1;
            } else {
                match state.failed_attempts.get(&task.expected_output) {
                    Some(&attempts) if attempts <= retry_limit => report.retry_eligible += 1,
                    Some(_) => report.failed += 1,
                    None => report.pending += 1,
                }
            }
        }
        report
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks: {} complete, {} failed, {} retry-eligible, {} pending",
            self.total, self.complete, self.failed, self.retry_eligible, self.pending
        )
    }
}

/// Summarize the run with the given log prefix without contacting a queue.
pub fn summarize_run(prefix: &str, retry_limit: u32) -> Result<RunReport, RunStateError> {
    let state = load_existing_state(prefix)?;
    Ok(RunReport::from_state(&state, retry_limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_every_nth_cycle() {
        let mut reporter = StatusReporter::new(3);
        let due: Vec<bool> = (0..7).map(|_| reporter.tick()).collect();
        assert_eq!(due, vec![false, false, true, false, false, true, false]);
        assert_eq!(reporter.cycles(), 7);
    }

    #[test]
    fn test_zero_interval_reports_every_cycle() {
        let mut reporter = StatusReporter::new(0);
        assert!(reporter.tick());
        assert!(reporter.tick());
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(3723)), "01:02:03");
        assert_eq!(format_elapsed(Duration::from_secs(100 * 3600)), "100:00:00");
    }

    #[test]
    fn test_format_status() {
        let stats = QueueStats {
            workers_connected: 4,
            workers_busy: 3,
            workers_idle: 1,
            tasks_running: 3,
            tasks_waiting: 7,
            ..QueueStats::default()
        };
        let line = format_status(&stats, &TaskSet::new(), Duration::from_secs(61));
        assert_eq!(
            line,
            "workers: 4 connected, 3 busy, 1 idle, 0 lost | tasks: 3 running, 7 waiting, 0 complete, 0 failed | elapsed 00:01:01"
        );
    }

    #[test]
    fn test_run_report_from_state() {
        use crate::run_state::LoggedTask;
        use std::path::PathBuf;

        let logged = |name: &str| LoggedTask {
            expected_output: PathBuf::from(name),
            command: format!("klipReduce -c {name}.cfg"),
        };
        let mut state = ExistingState {
            all: vec![logged("a"), logged("b"), logged("c"), logged("d")],
            ..ExistingState::default()
        };
        state.complete.insert(PathBuf::from("a"));
        state.failed_attempts.insert(PathBuf::from("a"), 1);
        state.failed_attempts.insert(PathBuf::from("b"), 1);
        state.failed_attempts.insert(PathBuf::from("c"), 3);

        let report = RunReport::from_state(&state, 2);
        assert_eq!(
            report,
            RunReport {
                total: 4,
                complete: 1,
                failed: 1,
                retry_eligible: 1,
                pending: 1,
            }
        );
        assert_eq!(
            report.to_string(),
            "4 tasks: 1 complete, 1 failed, 1 retry-eligible, 1 pending"
        );
    }
}
