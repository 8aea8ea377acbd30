use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info};

use super::{BackedUpBlob, BackupDirectory};
use crate::blobpath;
use crate::executor::{operation, Operation, ParallelExecutor};
use crate::utils::{BackupError, Result};

#[derive(Debug)]
pub enum BackupToComplete {
    Pending {
        /// The new backup directory; its bucket also holds `blobs_to_copy`.
        backup_directory: BackupDirectory,
        blobs_to_copy: Vec<BackedUpBlob>,
    },
    SameAs(String),
}

impl BackupToComplete {
    fn copies(backup_directory: &BackupDirectory, blobs: &[BackedUpBlob]) -> Result<Vec<Operation>> {
        blobs
            .iter()
            .map(|blob| {
                let bucket = Arc::clone(&backup_directory.bucket);
                let src = blob.path.clone();
                let dst = blobpath::join(&backup_directory.path, blob.live_blob_path()?);
                Ok(operation(async move { bucket.copy_blob_within_bucket(&src, &dst).await }))
            })
            .collect()
    }
}

/// Second phase of an incremental backup: copies reusable blobs into the new
/// backup directories and marks each of them complete.
pub struct BackupCompleter {
    backups_to_complete: BTreeMap<String, BackupToComplete>,
    executor: ParallelExecutor,
}

impl BackupCompleter {
    pub fn new(backups_to_complete: BTreeMap<String, BackupToComplete>) -> Self {
        Self {
            backups_to_complete,
            executor: ParallelExecutor::default(),
        }
    }

    pub fn with_executor(mut self, executor: ParallelExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Every bucket is attempted; failures are reported together at the end.
    pub async fn run(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (id, to_complete) in &self.backups_to_complete {
            let BackupToComplete::Pending {
                backup_directory,
                blobs_to_copy,
            } = to_complete
            else {
                continue;
            };

            if let Err(e) = self.complete(backup_directory, blobs_to_copy).await {
                error!("Completing backup of bucket {} failed: {}", id, e);
                errors.push(e);
            } else {
                info!(
                    "Completed backup of bucket {} in {} ({} blobs carried over)",
                    id,
                    backup_directory.path,
                    blobs_to_copy.len()
                );
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BackupError::aggregate("failed to complete backup", errors))
        }
    }

    async fn complete(&self, backup_directory: &BackupDirectory, blobs: &[BackedUpBlob]) -> Result<()> {
        let copies = BackupToComplete::copies(backup_directory, blobs)?;

        let errors = self.executor.run_batch(copies).await;
        if !errors.is_empty() {
            return Err(BackupError::aggregate(
                format!("failed to copy blobs into backup directory '{}'", backup_directory.path),
                errors,
            ));
        }

        backup_directory.mark_complete().await
    }
}
