//! Archival compaction of completed outputs.
//!
//! Completed outputs accumulate until the batch threshold is reached, then go
//! into `<batch_root><N>.tar.gz` and the originals are removed. Ordinals
//! continue after the highest archive already on disk.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Archive filesystem errors.
#[derive(Debug, Error)]
pub enum FilesystemError {
    #[error("Failed to scan {dir} for existing batches: {source}")]
    Scan {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to create archive {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write archive {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of one compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub ordinal: u64,
    pub path: PathBuf,
    /// Files now in the archive, in the order they were completed.
    pub archived: Vec<PathBuf>,
    /// Files that vanished before they could be archived.
    pub skipped: Vec<PathBuf>,
}

/// Collects completed outputs and compacts them into numbered batches.
#[derive(Debug)]
pub struct ArchiveCompactor {
    batch_root: PathBuf,
    threshold: usize,
    next_ordinal: u64,
    pending: Vec<PathBuf>,
    pending_set: HashSet<PathBuf>,
}

impl ArchiveCompactor {
    /// Create a compactor, continuing numbering after any existing batches.
    pub fn open(batch_root: impl Into<PathBuf>, threshold: usize) -> Result<Self, FilesystemError> {
        let batch_root = batch_root.into();
        let next_ordinal = next_ordinal(&batch_root)?;
        debug!(
            batch_root = %batch_root.display(),
            next_ordinal,
            threshold,
            "Archive compactor ready"
        );
        Ok(Self {
            batch_root,
            threshold: threshold.max(1),
            next_ordinal,
            pending: Vec::new(),
            pending_set: HashSet::new(),
        })
    }

    /// Queue a completed output. Returns false if it is already queued.
    pub fn add(&mut self, output: &Path) -> bool {
        if !self.pending_set.insert(output.to_path_buf()) {
            return false;
        }
        self.pending.push(output.to_path_buf());
        true
    }

    pub fn pending(&self) -> &[PathBuf] {
        &self.pending
    }

    pub fn next_ordinal(&self) -> u64 {
        self.next_ordinal
    }

    /// True once enough outputs are queued for a batch.
    pub fn should_compact(&self) -> bool {
        self.pending.len() >= self.threshold
    }

    /// Compact everything queued into the next batch.
    ///
    /// Returns `None` when nothing was left to archive; no ordinal is used
    /// in that case. A file whose entry name is already taken in this batch
    /// stays queued for the next one.
    pub fn compact(&mut self) -> Result<Option<BatchReport>, FilesystemError> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        let mut present = Vec::new();
        let mut skipped = Vec::new();
        let mut deferred = Vec::new();
        let mut names = HashSet::new();
        for file in &self.pending {
            if !file.is_file() {
                warn!(file = %file.display(), "Completed output vanished before archival, skipping");
                skipped.push(file.clone());
            } else if names.insert(entry_name(file)) {
                present.push(file.clone());
            } else {
                debug!(file = %file.display(), "Entry name already in this batch, deferring");
                deferred.push(file.clone());
            }
        }

        if present.is_empty() {
            self.requeue(deferred);
            return Ok(None);
        }

        let ordinal = self.next_ordinal;
        let path = archive_path(&self.batch_root, ordinal);
        let archived = write_archive(&path, &present, &mut skipped)?;

        if archived.is_empty() {
            // Everything vanished mid-batch; leave no empty archive behind.
            if let Err(e) = fs::remove_file(&path) {
                warn!(archive = %path.display(), error = %e, "Failed to remove empty archive");
            }
            self.requeue(deferred);
            return Ok(None);
        }

        for file in &archived {
            match fs::remove_file(file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(file = %file.display(), "Archived output already removed");
                }
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Failed to remove archived output");
                }
            }
        }

        self.next_ordinal += 1;
        self.requeue(deferred);

        info!(
            archive = %path.display(),
            files = archived.len(),
            skipped = skipped.len(),
            deferred = self.pending.len(),
            "Compacted batch"
        );

        Ok(Some(BatchReport {
            ordinal,
            path,
            archived,
            skipped,
        }))
    }

    /// Compact whatever is left at the end of a run, regardless of count.
    pub fn finish(&mut self) -> Result<Vec<BatchReport>, FilesystemError> {
        let mut reports = Vec::new();
        while !self.pending.is_empty() {
            if let Some(report) = self.compact()? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// Replace the queue with `files`.
    fn requeue(&mut self, files: Vec<PathBuf>) {
        self.pending_set = files.iter().cloned().collect();
        self.pending = files;
    }
}

/// `<batch_root><ordinal>.tar.gz`
pub fn archive_path(batch_root: &Path, ordinal: u64) -> PathBuf {
    let mut name = batch_root.as_os_str().to_os_string();
    name.push(format!("{ordinal}.tar.gz"));
    PathBuf::from(name)
}

/// Name a file gets inside an archive: its path with the root, `.` and `..`
/// components dropped, the way `tar` stores members.
pub fn entry_name(file: &Path) -> PathBuf {
    file.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// One past the highest ordinal of the existing `<batch_root>N.tar.gz` files.
fn next_ordinal(batch_root: &Path) -> Result<u64, FilesystemError> {
    let dir = match batch_root.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Some(stem) = batch_root.file_name().and_then(|s| s.to_str()) else {
        return Ok(0);
    };

    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(source) => return Err(FilesystemError::Scan { dir, source }),
    };

    let mut highest: Option<u64> = None;
    for entry in entries {
        let entry = entry.map_err(|source| FilesystemError::Scan {
            dir: dir.clone(),
            source,
        })?;
        let name = entry.file_name();
        let Some(ordinal) = name.to_str().and_then(|n| parse_ordinal(n, stem)) else {
            continue;
        };
        highest = Some(highest.map_or(ordinal, |h| h.max(ordinal)));
    }

    Ok(highest.map_or(0, |h| h + 1))
}

fn parse_ordinal(name: &str, stem: &str) -> Option<u64> {
    let digits = name.strip_prefix(stem)?.strip_suffix(".tar.gz")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Write the archive, returning the files that made it in. Files that
/// disappear between the existence check and the read are added to `skipped`.
fn write_archive(
    path: &Path,
    files: &[PathBuf],
    skipped: &mut Vec<PathBuf>,
) -> Result<Vec<PathBuf>, FilesystemError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| FilesystemError::Create {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| FilesystemError::Create {
            path: path.to_path_buf(),
            source,
        })?;
    let write_err = |source| FilesystemError::Write {
        path: path.to_path_buf(),
        source,
    };

    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut archived = Vec::with_capacity(files.len());

    for source in files {
        let mut input = match File::open(source) {
            Ok(input) => input,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(file = %source.display(), "Completed output vanished during archival, skipping");
                skipped.push(source.clone());
                continue;
            }
            Err(e) => return Err(write_err(e)),
        };
        builder
            .append_file(entry_name(source), &mut input)
            .map_err(write_err)?;
        archived.push(source.clone());
    }

    let encoder = builder.into_inner().map_err(write_err)?;
    let file = encoder.finish().map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    Ok(archived)
}
