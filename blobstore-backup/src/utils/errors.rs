//! Error types for backup and restore runs.

use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Artifact and configuration disagree about which containers exist.
    #[error("{0}")]
    Config(String),

    /// Soft delete or versioning is not set up the way the variant requires.
    #[error("{0}")]
    Precondition(String),

    /// Failure reported by a storage provider, passed through verbatim.
    #[error("{0}")]
    Remote(String),

    #[error("{context}: {message}")]
    Storage { context: String, message: String },

    #[error("{context}: [{}]", .attempts.join(" "))]
    RetriesExhausted {
        context: String,
        attempts: Vec<String>,
    },

    #[error("{context}: {}", join_lines(.errors))]
    Aggregate {
        context: String,
        errors: Vec<BackupError>,
    },

    #[error("{0}")]
    Integrity(String),

    #[error(
        "copy of blob '{blob}' from container '{from_container}' to container '{to_container}' failed with status '{status}'"
    )]
    CopyFailed {
        blob: String,
        from_container: String,
        to_container: String,
        status: String,
    },

    #[error("{0}")]
    Artifact(String),

    #[error("operations did not finish within {0:?}")]
    DeadlineExceeded(Duration),

    #[error("copy task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl BackupError {
    /// Wraps a remote failure with the operation and resource it concerned.
    pub fn storage(context: impl Into<String>, err: impl Display) -> Self {
        BackupError::Storage {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn aggregate(context: impl Into<String>, errors: Vec<BackupError>) -> Self {
        BackupError::Aggregate {
            context: context.into(),
            errors,
        }
    }

    /// Prefixes an existing error with more context, keeping its message intact.
    pub fn context(self, context: impl Into<String>) -> Self {
        BackupError::storage(context, self)
    }
}

fn join_lines(errors: &[BackupError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, BackupError>;
