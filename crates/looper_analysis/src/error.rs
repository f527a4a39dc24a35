//! Error types for analysis and artifact I/O

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the `.npz` / `.npy` codec.
#[derive(Error, Debug)]
pub enum NpzError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Missing array '{0}' in archive")]
    MissingArray(String),

    #[error("Invalid .npy header: {0}")]
    Header(String),

    #[error("Unsupported dtype '{0}' (expected '<f8' or '<f4')")]
    UnsupportedDtype(String),

    #[error("Unexpected shape for '{name}': {shape:?}")]
    Shape { name: String, shape: Vec<usize> },
}

/// Errors returned by an analyzer for a single input.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Input {path} too short: {samples} samples, need at least {needed}")]
    InputTooShort {
        path: PathBuf,
        samples: usize,
        needed: usize,
    },

    #[error("Invalid analysis parameters: {0}")]
    InvalidParams(String),

    #[error("Artifact error: {0}")]
    Artifact(#[from] NpzError),

    #[error("Analysis failed: {0}")]
    Failed(String),
}

impl AnalysisError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        AnalysisError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AnalysisError>;
