//! Runs one task inside a private sandbox directory.
//!
//! The input file is staged under its remote name, the command is spawned
//! directly (no shell) with the sandbox as working directory, and the output
//! file, if the command produced it, is copied back to its local path.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use findr_core::{QueueTaskId, SessionId};

use super::{FinishedTask, ResourceUsage, TaskSpec};

/// Bytes of stderr kept for diagnostics.
const STDERR_TAIL: usize = 4096;

/// Errors that stop a task before or after its command runs.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to create sandbox {path}: {source}")]
    Sandbox {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to stage input {path}: {source}")]
    StageInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// What happened after the command was launched.
struct Execution {
    exit_status: Option<i32>,
    stderr: String,
    bytes_read: u64,
    bytes_written: u64,
    collect_error: Option<String>,
}

/// `<sandbox_root>/<session>-task-<id>`; ids restart with every session.
pub fn sandbox_dir(sandbox_root: &Path, session: &SessionId, id: QueueTaskId) -> PathBuf {
    sandbox_root.join(format!("{session}-task-{id}"))
}

/// Run `spec` in `sandbox` and report the result.
pub async fn run_task(id: QueueTaskId, spec: &TaskSpec, sandbox: &Path, monitor: bool) -> FinishedTask {
    let started_at = Utc::now();
    let clock = Instant::now();

    let result = execute(spec, sandbox).await;

    if let Err(e) = tokio::fs::remove_dir_all(sandbox).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(sandbox = %sandbox.display(), error = %e, "Failed to remove task sandbox");
        }
    }

    let wall_time = clock.elapsed();
    let finished_at = Utc::now();

    match result {
        Ok(execution) => {
            let resources = monitor.then(|| ResourceUsage {
                wall_time,
                cores: 1,
                total_processes: 1,
                max_concurrent_processes: 1,
                bytes_read: execution.bytes_read,
                bytes_written: execution.bytes_written,
                ..ResourceUsage::default()
            });
            FinishedTask {
                id,
                tag: spec.tag.clone(),
                exit_status: execution.exit_status,
                error: execution.collect_error,
                stderr: execution.stderr,
                started_at,
                finished_at,
                resources,
            }
        }
        Err(e) => FinishedTask {
            id,
            tag: spec.tag.clone(),
            exit_status: None,
            error: Some(e.to_string()),
            stderr: String::new(),
            started_at,
            finished_at,
            resources: monitor.then(|| ResourceUsage {
                wall_time,
                ..ResourceUsage::default()
            }),
        },
    }
}

async fn execute(spec: &TaskSpec, sandbox: &Path) -> Result<Execution, ExecutorError> {
    let sandbox_err = |source| ExecutorError::Sandbox {
        path: sandbox.to_path_buf(),
        source,
    };
    // Never collect output left behind by an earlier run.
    match tokio::fs::remove_dir_all(sandbox).await {
        Ok(()) => warn!(sandbox = %sandbox.display(), "Removed stale task sandbox"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(sandbox_err(e)),
    }
    tokio::fs::create_dir_all(sandbox).await.map_err(sandbox_err)?;

    let staged = sandbox.join(&spec.input.remote_name);
    let bytes_read = tokio::fs::copy(&spec.input.local, &staged)
        .await
        .map_err(|source| ExecutorError::StageInput {
            path: spec.input.local.clone(),
            source,
        })?;

    let program = resolve_program(&spec.command.program);
    debug!(program = %program.display(), args = ?spec.command.args, "Spawning task command");

    let output = Command::new(&program)
        .args(&spec.command.args)
        .current_dir(sandbox)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ExecutorError::Spawn {
            program: spec.command.program.clone(),
            source,
        })?;

    let (bytes_written, collect_error) = collect_output(spec, sandbox).await;

    Ok(Execution {
        exit_status: output.status.code(),
        stderr: stderr_tail(&output.stderr),
        bytes_read,
        bytes_written,
        collect_error,
    })
}

/// Copy the produced output back. A missing output is not an error here;
/// the reconciler decides what it means.
async fn collect_output(spec: &TaskSpec, sandbox: &Path) -> (u64, Option<String>) {
    let produced = sandbox.join(&spec.output.remote_name);
    if !tokio::fs::try_exists(&produced).await.unwrap_or(false) {
        return (0, None);
    }

    if let Some(parent) = spec.output.local.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return (0, Some(format!("Failed to create {}: {}", parent.display(), e)));
        }
    }

    match tokio::fs::copy(&produced, &spec.output.local).await {
        Ok(bytes) => (bytes, None),
        Err(e) => (
            0,
            Some(format!(
                "Failed to collect output {}: {}",
                spec.output.local.display(),
                e
            )),
        ),
    }
}

/// Relative program paths with a directory part are resolved against the
/// control process's working directory, not the sandbox.
fn resolve_program(program: &str) -> PathBuf {
    let path = PathBuf::from(program);
    if path.is_relative() && path.components().count() > 1 {
        if let Ok(cwd) = std::env::current_dir() {
            return cwd.join(path);
        }
    }
    path
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&stderr[start..]).trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use findr_core::ReduceCommand;

    use crate::queue::FileSpec;

    #[test]
    fn test_resolve_program() {
        assert_eq!(resolve_program("klipReduce"), PathBuf::from("klipReduce"));
        assert_eq!(resolve_program("/usr/bin/true"), PathBuf::from("/usr/bin/true"));
        assert!(resolve_program("./bin/klipReduce").is_absolute());
    }

    #[test]
    fn test_stderr_tail() {
        let long = vec![b'x'; STDERR_TAIL + 10];
        assert_eq!(stderr_tail(&long).len(), STDERR_TAIL);
        assert_eq!(stderr_tail(b"boom\n"), "boom");
    }

    #[test]
    fn test_sandbox_dir_differs_between_sessions() {
        let root = Path::new("sandbox");
        let id = QueueTaskId::new(1);
        let first = sandbox_dir(root, &SessionId::generate(), id);
        let second = sandbox_dir(root, &SessionId::generate(), id);
        assert_ne!(first, second);
        assert!(first.starts_with(root));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_sandbox_output_is_not_collected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cfg"), "config").unwrap();
        let sandbox = dir.path().join("sandbox").join("task-1");
        std::fs::create_dir_all(&sandbox).unwrap();
        std::fs::write(sandbox.join("a.out"), "stale").unwrap();

        let spec = TaskSpec {
            command: ReduceCommand::new("true", Vec::new()),
            tag: ReduceCommand::new("true", Vec::new()).tag(),
            input: FileSpec::uncached(&dir.path().join("a.cfg")).unwrap(),
            output: FileSpec::uncached(&dir.path().join("a.out")).unwrap(),
        };
        let finished = run_task(QueueTaskId::new(1), &spec, &sandbox, false).await;

        assert_eq!(finished.exit_status, Some(0));
        assert!(!dir.path().join("a.out").exists());
        assert!(!sandbox.exists());
    }
}
