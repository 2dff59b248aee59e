//! Error types for DiffSleuth.
//!
//! Adapter and hive errors are *localized*: the scanner and hive loader catch
//! them at the smallest scope and turn them into entry flags or diagnostics.
//! Only [`CompareError`] aborts a comparison.
use crate::model::{Side, Stage};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a guest access adapter for one path.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("{path}: not found")]
    NotFound { path: String },

    #[error("{path}: permission denied")]
    PermissionDenied { path: String },

    /// Broken filesystem structure reported by the adapter.
    #[error("{path}: corrupt filesystem structure: {detail}")]
    Corrupt { path: String, detail: String },

    #[error("{path}: I/O error: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl AdapterError {
    /// Map an I/O error for `path` onto the closest adapter error.
    pub fn from_io(path: impl Into<String>, err: io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source: err },
        }
    }

    /// Guest path the error relates to.
    pub fn path(&self) -> &str {
        match self {
            Self::NotFound { path }
            | Self::PermissionDenied { path }
            | Self::Corrupt { path, .. }
            | Self::Io { path, .. } => path,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Failure reported by a hive access adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HiveError {
    #[error("hive {hive}: not found")]
    NotFound { hive: String },

    /// A key or value structure could not be parsed.
    #[error("hive {hive}: corrupt structure at '{key}': {detail}")]
    Corrupt {
        hive: String,
        key: String,
        detail: String,
    },

    #[error("hive {hive}: I/O error: {detail}")]
    Io { hive: String, detail: String },

    #[error("invalid hive handle {0}")]
    InvalidHandle(u64),
}

impl HiveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Fatal errors -- the comparison is aborted and no report is produced.
#[derive(Error, Debug)]
pub enum CompareError {
    #[error("{side} image: root path '{root}' does not exist")]
    RootNotFound { side: Side, root: String },

    /// The adapter listed the same path twice, violating its contract.
    #[error("{side} image: adapter reported duplicate path '{path}'")]
    DuplicatePath { side: Side, path: String },

    /// The adapter could not start listing the tree at all.
    #[error("{side} image: {stage} failed: {source}")]
    Adapter {
        side: Side,
        stage: Stage,
        #[source]
        source: AdapterError,
    },

    /// A whole-image unit (tree walk) failed, panicked or timed out.
    #[error("{side} image: {stage} did not complete: {reason}")]
    StageFailed {
        side: Side,
        stage: Stage,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot prepare extraction directory {path}: {source}")]
    ExtractDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("comparison cancelled")]
    Cancelled,
}

/// Convenience alias for comparison results.
pub type CompareResult<T> = Result<T, CompareError>;
