//! Blobstore Backup Library
//!
//! Incremental backup and restore of unversioned buckets, and full-snapshot
//! backup and restore of soft-delete capable containers.

pub mod artifact;
pub mod blobpath;
pub mod builder;
pub mod config;
pub mod executor;
pub mod incremental;
pub mod retry;
pub mod snapshot;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use config::Settings;
pub use utils::errors::{BackupError, Result};
