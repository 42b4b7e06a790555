//! Event log of a queue session (`<prefix>_queue.log`).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

use findr_core::{QueueTaskId, SessionId, TaskTag};

/// Append-only, tab-separated record of what the session did.
pub struct QueueLog {
    file: Mutex<File>,
}

impl QueueLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn session_started(&self, session: &SessionId, port: u16, workers: usize) {
        self.write(&[
            "SESSION",
            session.as_str(),
            &format!("port={port}"),
            &format!("workers={workers}"),
        ]);
    }

    pub fn task_event(&self, event: &str, id: QueueTaskId, tag: &TaskTag) {
        self.write(&[event, &id.to_string(), tag.as_str()]);
    }

    pub fn task_finished(&self, id: QueueTaskId, tag: &TaskTag, exit_status: Option<i32>) {
        let status = exit_status.map_or_else(|| "none".to_string(), |c| c.to_string());
        self.write(&["FINISHED", &id.to_string(), tag.as_str(), &status]);
    }

    /// The queue log is diagnostic; a failed write is reported and dropped.
    fn write(&self, fields: &[&str]) {
        let line = format!("{}\t{}\n", Utc::now().to_rfc3339(), fields.join("\t"));
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
            warn!(error = %e, "Failed to write queue log");
        }
    }
}
