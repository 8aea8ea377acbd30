//! Incremental backup of unversioned buckets.
//!
//! A run is split in two phases. The starter copies blobs that are new since
//! the last complete backup and records the rest as reusable; the completer
//! later copies the reusable blobs forward inside the backup bucket and drops
//! the `backup_complete` marker. The restorer copies a backup directory back
//! into the live bucket.

mod backed_up_blob;
mod backup_directory;
mod completer;
mod finder;
mod restorer;
mod starter;

pub use backed_up_blob::BackedUpBlob;
pub use backup_directory::{BackupDirectory, Clock, SystemClock, BACKUP_COMPLETE, TIMESTAMP_FORMAT};
pub use completer::{BackupCompleter, BackupToComplete};
pub use finder::{BackupDirectoryFinder, LastBackupDirectoryFinder, ScanOrder};
pub use restorer::{RestoreBucketPair, Restorer};
pub use starter::{
    diff_live_blobs, mark_same_backups_to_start, BackupBucketPair, BackupStarter, BackupToStart, BlobDiff,
};

use serde::{Deserialize, Serialize};

use crate::artifact::Record;

/// One bucket's entry in either incremental artifact.
///
/// In the backup artifact `blobs` lists every blob of the new backup and
/// `src_backup_directory_path` is the new directory. In the existing-blobs
/// artifact `blobs` are the reusable blobs in the previous directory
/// (`src_backup_directory_path`) that the completer copies to
/// `dst_backup_directory_path`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketBackup {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket_region: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blobs: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src_backup_directory_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dst_backup_directory_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_bucket_as: Option<String>,
}

impl BucketBackup {
    pub fn same_as(bucket_id: impl Into<String>) -> Self {
        Self {
            same_bucket_as: Some(bucket_id.into()),
            ..Self::default()
        }
    }
}

impl Record for BucketBackup {
    fn same_as(&self) -> Option<&str> {
        self.same_bucket_as.as_deref()
    }

    fn has_primary_fields(&self) -> bool {
        !self.bucket_name.is_empty()
            || !self.bucket_region.is_empty()
            || !self.blobs.is_empty()
            || !self.src_backup_directory_path.is_empty()
            || !self.dst_backup_directory_path.is_empty()
    }
}
