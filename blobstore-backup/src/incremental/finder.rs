use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use super::{BackedUpBlob, BackupDirectory};
use crate::blobpath;
use crate::storage::Bucket;
use crate::utils::Result;

static BACKUP_DIRECTORY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}(_\d{2}){5}$").expect("backup directory pattern is valid")
});

/// Locates the blobs of the backup an incremental run builds on.
#[async_trait]
pub trait BackupDirectoryFinder: Send + Sync {
    /// Blobs of the chosen complete backup of `bucket_id`, or an empty list
    /// when there is none yet.
    async fn list_blobs(&self, bucket_id: &str) -> Result<Vec<BackedUpBlob>>;
}

impl std::fmt::Debug for dyn BackupDirectoryFinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BackupDirectoryFinder")
    }
}

/// Order in which timestamped directories are checked for completeness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanOrder {
    /// Ascending; the first complete directory wins.
    #[default]
    OldestFirst,
    /// Descending; the most recent complete directory wins.
    NewestFirst,
}

pub struct LastBackupDirectoryFinder {
    bucket: Arc<dyn Bucket>,
    order: ScanOrder,
}

impl LastBackupDirectoryFinder {
    pub fn new(bucket: Arc<dyn Bucket>) -> Self {
        Self {
            bucket,
            order: ScanOrder::default(),
        }
    }

    pub fn with_order(mut self, order: ScanOrder) -> Self {
        self.order = order;
        self
    }
}

#[async_trait]
impl BackupDirectoryFinder for LastBackupDirectoryFinder {
    async fn list_blobs(&self, bucket_id: &str) -> Result<Vec<BackedUpBlob>> {
        let mut timestamps: Vec<String> = self
            .bucket
            .list_directories()
            .await?
            .into_iter()
            .filter(|dir| BACKUP_DIRECTORY_NAME.is_match(dir))
            .collect();

        if timestamps.is_empty() {
            debug!("No backup directories in bucket {}", self.bucket.name());
            return Ok(Vec::new());
        }

        // Zero-padded fixed width, so lexicographic order is chronological.
        timestamps.sort();
        if self.order == ScanOrder::NewestFirst {
            timestamps.reverse();
        }

        for timestamp in timestamps {
            let directory = BackupDirectory::new(blobpath::join(&timestamp, bucket_id), Arc::clone(&self.bucket));
            if directory.is_complete().await? {
                info!("Using backup directory {} as baseline for {}", directory.path, bucket_id);
                return directory.list_blobs().await;
            }
        }

        debug!("No complete backup of {} in bucket {}", bucket_id, self.bucket.name());
        Ok(Vec::new())
    }
}
