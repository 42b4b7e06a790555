//! Core domain errors.

use thiserror::Error;

use crate::TaskStatus;

/// Core domain errors for FINDR.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No task record exists for the given expected output.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition for {output}: {from} -> {to}")]
    InvalidStateTransition {
        output: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A path has no usable file name.
    #[error("Path has no file name: {0}")]
    InvalidPath(String),

    /// Two task records would share the same expected output.
    #[error("Duplicate expected output: {0}")]
    DuplicateOutput(String),

    /// Two task records would share the same tag.
    #[error("Duplicate task tag '{tag}' for outputs {first} and {second}")]
    DuplicateTag {
        tag: String,
        first: String,
        second: String,
    },
}
