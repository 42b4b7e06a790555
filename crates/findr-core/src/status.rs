//! Status enums for task records and pool workers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a task record within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Loaded from the manifest or the run logs, not yet handed to a queue.
    #[default]
    Read,
    /// Handed to the dispatch queue.
    Submitted,
    /// Failed within the retry limit; a resumed run may submit it again.
    Waiting,
    /// Finished with exit status 0 and its expected output on disk.
    Complete,
    /// Failed and out of retries.
    Failed,
}

impl TaskStatus {
    /// Returns true if a live transition from `self` to `next` is allowed.
    ///
    /// Progress is monotonic; the only backwards edge is FAILED -> WAITING
    /// when a failure is still within the retry limit.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Read, Submitted)
                | (Waiting, Submitted)
                | (Submitted, Complete)
                | (Submitted, Failed)
                | (Failed, Waiting)
        )
    }

    /// Returns true if a run should hand this task to the queue.
    pub fn is_submittable(&self) -> bool {
        matches!(self, Self::Read | Self::Waiting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Submitted => "SUBMITTED",
            Self::Waiting => "WAITING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a worker slot in the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Connected and ready to accept a task.
    #[default]
    Idle,
    /// Running a task.
    Busy,
}

impl WorkerStatus {
    /// Returns true if the worker can accept a task.
    pub fn can_accept_tasks(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(TaskStatus::Read.can_transition_to(TaskStatus::Submitted));
        assert!(TaskStatus::Submitted.can_transition_to(TaskStatus::Complete));
        assert!(TaskStatus::Submitted.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Waiting));
        assert!(TaskStatus::Waiting.can_transition_to(TaskStatus::Submitted));
    }

    #[test]
    fn test_backwards_transitions_rejected() {
        assert!(!TaskStatus::Complete.can_transition_to(TaskStatus::Submitted));
        assert!(!TaskStatus::Complete.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Submitted.can_transition_to(TaskStatus::Read));
        assert!(!TaskStatus::Waiting.can_transition_to(TaskStatus::Complete));
        assert!(!TaskStatus::Read.can_transition_to(TaskStatus::Complete));
    }

    #[test]
    fn test_submittable() {
        assert!(TaskStatus::Read.is_submittable());
        assert!(TaskStatus::Waiting.is_submittable());
        assert!(!TaskStatus::Failed.is_submittable());
        assert!(!TaskStatus::Complete.is_submittable());
    }

    #[test]
    fn test_display_matches_serde_names() {
        let json = serde_json::to_string(&TaskStatus::Complete).unwrap();
        assert_eq!(json, format!("\"{}\"", TaskStatus::Complete));
    }
}
