//! Manifest parsing.
//!
//! A manifest lists one task per line: `<config_path> <expected_output_path>`,
//! separated by any whitespace. Blank lines and `#` comments are skipped.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::{CoreError, TaskSet};

/// Manifest errors.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed manifest line {line}: '{content}' (expected '<config> <output>')")]
    Malformed { line: usize, content: String },

    #[error(
        "Conflicting config for {output} on line {line}: '{second}' (first listed with '{first}')"
    )]
    ConflictingConfig {
        line: usize,
        output: PathBuf,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Outputs {first} and {second} would run the same command '{command}'")]
    DuplicateCommand {
        command: String,
        first: String,
        second: String,
    },

    #[error("Manifest lists no tasks")]
    Empty,

    #[error(transparent)]
    Task(#[from] CoreError),
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// 1-based line number in the manifest.
    pub line: usize,
    pub config_path: PathBuf,
    pub expected_output: PathBuf,
}

/// Parse manifest text into entries, in file order.
///
/// An exact duplicate line is collapsed into the first occurrence; an output
/// listed twice with different configs is an error.
pub fn parse_manifest(text: &str) -> Result<Vec<ManifestEntry>, ManifestError> {
    let mut entries: Vec<ManifestEntry> = Vec::new();
    let mut seen: HashMap<PathBuf, usize> = HashMap::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let [config, output] = fields.as_slice() else {
            return Err(ManifestError::Malformed {
                line,
                content: trimmed.to_string(),
            });
        };

        let entry = ManifestEntry {
            line,
            config_path: PathBuf::from(config),
            expected_output: PathBuf::from(output),
        };

        if let Some(&existing) = seen.get(&entry.expected_output) {
            let first = &entries[existing];
            if first.config_path != entry.config_path {
                return Err(ManifestError::ConflictingConfig {
                    line,
                    output: entry.expected_output,
                    first: first.config_path.clone(),
                    second: entry.config_path,
                });
            }
            warn!(
                line,
                first_line = first.line,
                output = %entry.expected_output.display(),
                "Duplicate manifest entry ignored"
            );
            continue;
        }

        seen.insert(entry.expected_output.clone(), entries.len());
        entries.push(entry);
    }

    if entries.is_empty() {
        return Err(ManifestError::Empty);
    }
    Ok(entries)
}

/// Read and parse a manifest file.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => ManifestError::NotFound(path.to_path_buf()),
        _ => ManifestError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    parse_manifest(&text)
}

/// Turn manifest entries into task records for `klip_reduce`.
pub fn build_tasks(entries: &[ManifestEntry], klip_reduce: &str) -> Result<TaskSet, ManifestError> {
    TaskSet::from_manifest(entries, klip_reduce).map_err(|e| match e {
        CoreError::DuplicateTag {
            tag,
            first,
            second,
        } => ManifestError::DuplicateCommand {
            command: tag,
            first,
            second,
        },
        other => ManifestError::Task(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let entries = parse_manifest("a.cfg a.out\nb.cfg\tb.out\n\n# comment\nc.cfg   c.out\n").unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].config_path, PathBuf::from("b.cfg"));
        assert_eq!(entries[1].expected_output, PathBuf::from("b.out"));
        assert_eq!(entries[2].line, 5);
    }

    #[test]
    fn test_malformed_line() {
        let err = parse_manifest("a.cfg a.out\nb.cfg\n").unwrap_err();
        assert!(matches!(err, ManifestError::Malformed { line: 2, .. }));

        let err = parse_manifest("a.cfg a.out extra\n").unwrap_err();
        assert!(matches!(err, ManifestError::Malformed { line: 1, .. }));
    }

    #[test]
    fn test_conflicting_config() {
        let err = parse_manifest("a.cfg x.out\nb.cfg x.out\n").unwrap_err();
        match err {
            ManifestError::ConflictingConfig { line, first, second, .. } => {
                assert_eq!(line, 2);
                assert_eq!(first, PathBuf::from("a.cfg"));
                assert_eq!(second, PathBuf::from("b.cfg"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_exact_duplicate_collapsed() {
        let entries = parse_manifest("a.cfg a.out\na.cfg a.out\n").unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_empty_manifest() {
        assert!(matches!(parse_manifest("\n# nothing\n"), Err(ManifestError::Empty)));
    }

    #[test]
    fn test_read_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_manifest(&dir.path().join("nope.list")).unwrap_err();
        assert!(matches!(err, ManifestError::NotFound(_)));
    }

    #[test]
    fn test_build_tasks_duplicate_command() {
        let entries = parse_manifest("one/a.cfg 1.out\ntwo/a.cfg 2.out\n").unwrap();
        let err = build_tasks(&entries, "klipReduce").unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateCommand { .. }));
    }
}
