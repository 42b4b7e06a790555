//! Task records and the ordered set of records making up a run.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{CoreError, ManifestEntry, ReduceCommand, TaskStatus, TaskTag};

/// One external reduction invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Output file the command must produce. Primary key of the run.
    pub expected_output: PathBuf,

    /// Configuration file driving the command.
    pub config_path: PathBuf,

    /// Command handed to the queue.
    pub command: ReduceCommand,

    /// Rendered command, used to correlate completions.
    pub tag: TaskTag,

    /// Current status.
    pub status: TaskStatus,

    /// Number of failed attempts so far.
    pub attempt_count: u32,
}

impl TaskRecord {
    /// Create a new record in the READ state.
    pub fn new(
        config_path: impl Into<PathBuf>,
        expected_output: impl Into<PathBuf>,
        command: ReduceCommand,
    ) -> Self {
        let tag = command.tag();
        Self {
            expected_output: expected_output.into(),
            config_path: config_path.into(),
            command,
            tag,
            status: TaskStatus::Read,
            attempt_count: 0,
        }
    }

    /// Expected output as it appears in the run logs.
    pub fn output_key(&self) -> String {
        self.expected_output.display().to_string()
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                output: self.output_key(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Record a failed attempt and return the new attempt count.
    pub fn record_attempt_failure(&mut self) -> Result<u32, CoreError> {
        self.transition(TaskStatus::Failed)?;
        self.attempt_count += 1;
        Ok(self.attempt_count)
    }
}

/// Task records in manifest order, indexed by expected output and by tag.
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    records: Vec<TaskRecord>,
    by_output: HashMap<PathBuf, usize>,
    by_tag: HashMap<TaskTag, usize>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build records for every manifest entry, in manifest order.
    pub fn from_manifest(entries: &[ManifestEntry], klip_reduce: &str) -> Result<Self, CoreError> {
        let mut set = Self::new();
        for entry in entries {
            let command = ReduceCommand::klip_reduce(klip_reduce, &entry.config_path)?;
            set.insert(TaskRecord::new(
                entry.config_path.clone(),
                entry.expected_output.clone(),
                command,
            ))?;
        }
        Ok(set)
    }

    /// Append a record. Expected outputs and tags must both be unique.
    pub fn insert(&mut self, record: TaskRecord) -> Result<(), CoreError> {
        if self.by_output.contains_key(&record.expected_output) {
            return Err(CoreError::DuplicateOutput(record.output_key()));
        }
        if let Some(&existing) = self.by_tag.get(&record.tag) {
            return Err(CoreError::DuplicateTag {
                tag: record.tag.to_string(),
                first: self.records[existing].output_key(),
                second: record.output_key(),
            });
        }

        let index = self.records.len();
        self.by_output.insert(record.expected_output.clone(), index);
        self.by_tag.insert(record.tag.clone(), index);
        self.records.push(record);
        Ok(())
    }

    pub fn get(&self, expected_output: &Path) -> Option<&TaskRecord> {
        self.by_output.get(expected_output).map(|&i| &self.records[i])
    }

    pub fn get_mut(&mut self, expected_output: &Path) -> Option<&mut TaskRecord> {
        match self.by_output.get(expected_output) {
            Some(&i) => Some(&mut self.records[i]),
            None => None,
        }
    }

    /// Look up the record a completion belongs to.
    pub fn by_tag_mut(&mut self, tag: &TaskTag) -> Option<&mut TaskRecord> {
        match self.by_tag.get(tag) {
            Some(&i) => Some(&mut self.records[i]),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Expected outputs of records a run should submit, in manifest order.
    pub fn submittable(&self) -> Vec<PathBuf> {
        self.records
            .iter()
            .filter(|r| r.status.is_submittable())
            .map(|r| r.expected_output.clone())
            .collect()
    }

    /// Number of records in the given status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    /// Rebuild statuses from replayed run logs.
    ///
    /// Outputs listed as complete become COMPLETE regardless of earlier
    /// failures. Outputs with failures keep their highest attempt count and
    /// become WAITING while `attempt_count <= retry_limit`, FAILED otherwise.
    /// Everything else stays READ.
    pub fn restore_from_logs(
        &mut self,
        complete: &HashSet<PathBuf>,
        failed_attempts: &HashMap<PathBuf, u32>,
        retry_limit: u32,
    ) {
        for record in &mut self.records {
            if complete.contains(&record.expected_output) {
                record.status = TaskStatus::Complete;
                continue;
            }
            if let Some(&attempts) = failed_attempts.get(&record.expected_output) {
                record.attempt_count = attempts;
                record.status = if attempts <= retry_limit {
                    TaskStatus::Waiting
                } else {
                    TaskStatus::Failed
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cfg: &str, out: &str) -> ManifestEntry {
        ManifestEntry {
            line: 1,
            config_path: PathBuf::from(cfg),
            expected_output: PathBuf::from(out),
        }
    }

    fn sample_set() -> TaskSet {
        TaskSet::from_manifest(
            &[entry("a.cfg", "a.out"), entry("b.cfg", "b.out"), entry("c.cfg", "c.out")],
            "klipReduce",
        )
        .unwrap()
    }

    #[test]
    fn test_from_manifest_keeps_order() {
        let set = sample_set();
        let outputs: Vec<String> = set.iter().map(|r| r.output_key()).collect();
        assert_eq!(outputs, vec!["a.out", "b.out", "c.out"]);
        assert!(set.iter().all(|r| r.status == TaskStatus::Read && r.attempt_count == 0));
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let result = TaskSet::from_manifest(
            &[entry("x/a.cfg", "1.out"), entry("y/a.cfg", "2.out")],
            "klipReduce",
        );
        assert!(matches!(result, Err(CoreError::DuplicateTag { .. })));
    }

    #[test]
    fn test_lookup_by_tag() {
        let mut set = sample_set();
        let record = set.by_tag_mut(&TaskTag::new("klipReduce -c b.cfg")).unwrap();
        assert_eq!(record.expected_output, PathBuf::from("b.out"));
        assert!(set.by_tag_mut(&TaskTag::new("klipReduce -c zzz.cfg")).is_none());
    }

    #[test]
    fn test_transition_rejects_invalid() {
        let mut set = sample_set();
        let record = set.get_mut(Path::new("a.out")).unwrap();
        assert!(matches!(
            record.transition(TaskStatus::Complete),
            Err(CoreError::InvalidStateTransition { .. })
        ));
        record.transition(TaskStatus::Submitted).unwrap();
        assert_eq!(record.record_attempt_failure().unwrap(), 1);
        assert_eq!(record.status, TaskStatus::Failed);
        record.transition(TaskStatus::Waiting).unwrap();
    }

    #[test]
    fn test_restore_from_logs() {
        let mut set = sample_set();
        let complete: HashSet<PathBuf> = [PathBuf::from("a.out")].into_iter().collect();
        let failed: HashMap<PathBuf, u32> = [
            (PathBuf::from("a.out"), 1),
            (PathBuf::from("b.out"), 1),
            (PathBuf::from("c.out"), 3),
        ]
        .into_iter()
        .collect();

        set.restore_from_logs(&complete, &failed, 2);

        assert_eq!(set.get(Path::new("a.out")).unwrap().status, TaskStatus::Complete);
        assert_eq!(set.get(Path::new("b.out")).unwrap().status, TaskStatus::Waiting);
        let c = set.get(Path::new("c.out")).unwrap();
        assert_eq!(c.status, TaskStatus::Failed);
        assert_eq!(c.attempt_count, 3);
        assert_eq!(set.submittable(), vec![PathBuf::from("b.out")]);
    }
}
