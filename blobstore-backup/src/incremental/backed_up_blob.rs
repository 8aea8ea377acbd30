use crate::blobpath;
use crate::utils::{BackupError, Result};

/// A blob stored inside a backup directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackedUpBlob {
    /// Full key, starting with `backup_directory_path/`.
    pub path: String,
    pub backup_directory_path: String,
    pub version: Option<String>,
}

impl BackedUpBlob {
    pub fn new(path: impl Into<String>, backup_directory_path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            backup_directory_path: backup_directory_path.into(),
            version: None,
        }
    }

    /// Key of the corresponding blob in the live bucket.
    ///
    /// Fails if `path` is not inside `backup_directory_path`, which only
    /// happens with a corrupted artifact.
    pub fn live_blob_path(&self) -> Result<&str> {
        blobpath::trim_prefix(&self.path, &self.backup_directory_path).ok_or_else(|| {
            BackupError::Integrity(format!(
                "blob '{}' is not inside backup directory '{}'",
                self.path, self.backup_directory_path
            ))
        })
    }
}
