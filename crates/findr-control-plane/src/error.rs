//! Run driver errors.

use std::path::PathBuf;

use thiserror::Error;

use findr_core::{CoreError, ManifestError};

use crate::archive::FilesystemError;
use crate::queue::{DispatchError, QueueInitError};
use crate::run_state::RunStateError;

/// Every way a run can fail.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    RunState(#[from] RunStateError),

    #[error(transparent)]
    QueueInit(#[from] QueueInitError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// The run logs name a task the manifest no longer lists.
    #[error("Task {output} from the run logs is not in manifest {manifest}")]
    NotInManifest { output: PathBuf, manifest: PathBuf },
}
