use std::sync::Arc;

use super::BackedUpBlob;
use crate::blobpath;
use crate::storage::Bucket;
use crate::utils::{BackupError, Result};

/// Name of the marker blob written as the very last step of a backup.
pub const BACKUP_COMPLETE: &str = "backup_complete";

/// chrono format of backup directory names, e.g. `2024_03_01_17_45_09`.
pub const TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";

/// Source of the timestamp that names a new backup directory.
pub trait Clock: Send + Sync {
    fn now(&self) -> String;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> String {
        chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
    }
}

/// `<timestamp>/<bucket id>` inside a backup bucket.
#[derive(Clone)]
pub struct BackupDirectory {
    pub path: String,
    pub bucket: Arc<dyn Bucket>,
}

impl std::fmt::Debug for BackupDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupDirectory")
            .field("path", &self.path)
            .field("bucket", &self.bucket.name())
            .finish()
    }
}

impl BackupDirectory {
    pub fn new(path: impl Into<String>, bucket: Arc<dyn Bucket>) -> Self {
        Self {
            path: path.into(),
            bucket,
        }
    }

    /// Every blob in the directory except the completion marker.
    pub async fn list_blobs(&self) -> Result<Vec<BackedUpBlob>> {
        let blobs = self.bucket.list_blobs(&self.path).await.map_err(|e| {
            BackupError::storage(format!("failed listing blobs in backup directory '{}'", self.path), e)
        })?;

        let marker = self.backup_complete_path();
        Ok(blobs
            .into_iter()
            .filter(|blob| blob.path != marker)
            .map(|blob| BackedUpBlob {
                path: blob.path,
                backup_directory_path: self.path.clone(),
                version: blob.version,
            })
            .collect())
    }

    pub async fn is_complete(&self) -> Result<bool> {
        self.bucket
            .has_blob(&self.backup_complete_path())
            .await
            .map_err(|e| {
                BackupError::storage(
                    format!("failed checking if backup directory '{}' is complete", self.path),
                    e,
                )
            })
    }

    pub async fn mark_complete(&self) -> Result<()> {
        self.bucket
            .upload_blob(&self.backup_complete_path(), "")
            .await
            .map_err(|e| {
                BackupError::storage(format!("failed marking backup directory '{}' as complete", self.path), e)
            })
    }

    fn backup_complete_path(&self) -> String {
        blobpath::join(&self.path, BACKUP_COMPLETE)
    }
}
