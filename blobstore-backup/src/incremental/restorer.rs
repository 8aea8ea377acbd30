use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::info;

use super::{BackedUpBlob, BucketBackup};
use crate::artifact::Artifact;
use crate::executor::{operation, Operation, ParallelExecutor};
use crate::storage::Bucket;
use crate::utils::{BackupError, Result};

#[derive(Debug)]
pub enum RestoreBucketPair {
    Pending {
        live_bucket: Arc<dyn Bucket>,
        backup_bucket: Arc<dyn Bucket>,
    },
    /// Restored through the ID it points at.
    SameAs(String),
}

impl RestoreBucketPair {
    pub fn new(live_bucket: Arc<dyn Bucket>, backup_bucket: Arc<dyn Bucket>) -> Self {
        RestoreBucketPair::Pending {
            live_bucket,
            backup_bucket,
        }
    }

    pub fn check_validity(&self) -> Result<()> {
        match self {
            RestoreBucketPair::Pending {
                live_bucket,
                backup_bucket,
            } if live_bucket.name() == backup_bucket.name() => Err(BackupError::Config(
                "live bucket and backup bucket cannot be the same".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

async fn check_backup_contents(backup_bucket: &dyn Bucket, backup: &BucketBackup) -> Result<()> {
    let present: HashSet<String> = backup_bucket
        .list_blobs(&backup.src_backup_directory_path)
        .await?
        .into_iter()
        .map(|blob| blob.path)
        .collect();

    let missing: Vec<&str> = backup
        .blobs
        .iter()
        .filter(|blob| !present.contains(*blob))
        .map(String::as_str)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(BackupError::Integrity(format!(
            "found blobs in artifact that are not present in backup directory for bucket {}: {}",
            backup_bucket.name(),
            missing.join(", ")
        )))
    }
}

fn restore_copies(
    live_bucket: &Arc<dyn Bucket>,
    backup_bucket: &Arc<dyn Bucket>,
    backup: &BucketBackup,
) -> Result<Vec<Operation>> {
    backup
        .blobs
        .iter()
        .map(|path| {
            let blob = BackedUpBlob::new(path.clone(), backup.src_backup_directory_path.clone());
            let dst = blob.live_blob_path()?.to_string();
            let live = Arc::clone(live_bucket);
            let source = Arc::clone(backup_bucket);
            Ok(operation(async move {
                live.copy_blob_from_bucket(source.as_ref(), &blob.path, &dst).await
            }))
        })
        .collect()
}

/// Copies backed-up blobs back into the live buckets.
pub struct Restorer {
    bucket_pairs: BTreeMap<String, RestoreBucketPair>,
    artifact: Arc<dyn Artifact<BucketBackup>>,
    executor: ParallelExecutor,
}

impl Restorer {
    pub fn new(bucket_pairs: BTreeMap<String, RestoreBucketPair>, artifact: Arc<dyn Artifact<BucketBackup>>) -> Self {
        Self {
            bucket_pairs,
            artifact,
            executor: ParallelExecutor::default(),
        }
    }

    pub fn with_executor(mut self, executor: ParallelExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// All validation runs before the first copy. The first bucket that fails
    /// to restore stops the run.
    pub async fn run(&self) -> Result<()> {
        let backups = self.artifact.load()?;

        for id in backups.keys() {
            if !self.bucket_pairs.contains_key(id) {
                return Err(BackupError::Config(format!(
                    "bucket {} is not mentioned in the restore config but is present in the artifact",
                    id
                )));
            }
        }
        for id in self.bucket_pairs.keys() {
            if !backups.contains_key(id) {
                return Err(BackupError::Config(format!(
                    "cannot restore bucket {}, not found in backup artifact",
                    id
                )));
            }
        }

        let mut planned = Vec::new();
        for (id, pair) in &self.bucket_pairs {
            pair.check_validity()?;

            let RestoreBucketPair::Pending {
                live_bucket,
                backup_bucket,
            } = pair
            else {
                continue;
            };
            let backup = &backups[id];
            if backup.blobs.is_empty() {
                info!("Nothing to restore for bucket {}", id);
                continue;
            }

            check_backup_contents(backup_bucket.as_ref(), backup).await?;
            let copies = restore_copies(live_bucket, backup_bucket, backup)?;
            planned.push((id, live_bucket, copies));
        }

        for (id, live_bucket, copies) in planned {
            info!("Restoring {} blobs into bucket {} ({})", copies.len(), live_bucket.name(), id);
            let errors = self.executor.run_batch(copies).await;
            if !errors.is_empty() {
                return Err(BackupError::aggregate(
                    format!("failed to restore bucket {}", live_bucket.name()),
                    errors,
                ));
            }
        }

        Ok(())
    }
}
