use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum DepotError {
    #[error("path not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("corrupt measurement {path}: {message}")]
    FormatCorruption { path: PathBuf, message: String },

    #[error("checksum mismatch for {key}: local {local}, remote {remote}")]
    Integrity {
        key: String,
        local: String,
        remote: String,
    },

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("found {count} unknown file(s) in {archive}")]
    #[diagnostic(help("inspect the working directory, or rerun with --ignore-unknown"))]
    UnknownFiles { archive: PathBuf, count: usize },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("format oracle failed: {0}")]
    Oracle(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("object store request failed: {0}")]
    ObjectStoreHttp(String),

    #[error("object store returned status {status}: {message}")]
    ObjectStoreStatus { status: u16, message: String },

    #[error("object store request timed out: {0}")]
    Timeout(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("dataset not found in catalog: {0}")]
    DatasetNotFound(String),

    #[error("resource not found in catalog: {0}")]
    ResourceNotFound(String),

    #[error("interrupted by operator")]
    Interrupted,
}

impl DepotError {
    /// Errors that must escape every per-item recovery boundary.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, DepotError::Interrupted)
    }
}
