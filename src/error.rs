use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures that stop a cleaning run. Malformed `entities`/`targets` JSON and an unavailable
/// bulk transform are recovered in place and never show up here.
#[derive(Debug, Error)]
pub enum CleanerError {
    #[error("CSV file {0} not found")]
    InputNotFound(PathBuf),
    #[error("input {path} has no '{column}' column")]
    MissingColumn { column: String, path: PathBuf },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to parse run configuration: {0}")]
    RunConfig(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, CleanerError>;
