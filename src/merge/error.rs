use std::path::PathBuf;

use thiserror::Error;

/// Failures of a merge run. Any of them aborts the run.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Input directory {path:?} not found")]
    NotFound { path: PathBuf },

    #[error("Input directory {path:?} contains no state subdirectories")]
    EmptyInput { path: PathBuf },

    #[error("Could not read state dataset {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Projection failed: {0}")]
    Projection(String),

    #[error("Could not write output {path:?}: {reason}")]
    Write { path: PathBuf, reason: String },
}
