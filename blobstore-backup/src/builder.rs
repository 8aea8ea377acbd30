//! Turns configuration and artifacts into runnable backup and restore plans.
//!
//! Bucket and account handles are opened through injected factories so the
//! same wiring runs against real stores and test doubles.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::artifact::{validate_references, Artifact};
use crate::config::{BucketConfig, ContainerConfig, Settings};
use crate::incremental::{
    mark_same_backups_to_start, BackedUpBlob, BackupBucketPair, BackupDirectory, BackupToComplete, BackupToStart,
    BucketBackup, LastBackupDirectoryFinder, RestoreBucketPair,
};
use crate::snapshot::{Backuper, Container, ContainerBackup, RestoreTarget, Restorer, StorageAccount};
use crate::storage::{Bucket, StoreLocation};
use crate::utils::{BackupError, Result};

/// Opens the bucket called `name` at a location.
pub type OpenBucket<'a> = &'a (dyn Fn(&str, &StoreLocation) -> Result<Arc<dyn Bucket>> + Sync);

/// Opens a storage account from its name and key.
pub type OpenAccount<'a> = &'a (dyn Fn(&str, &str) -> Result<Arc<dyn StorageAccount>> + Sync);

async fn ensure_unversioned(bucket: &dyn Bucket) -> Result<()> {
    if bucket.is_versioned().await? {
        return Err(BackupError::Precondition(format!("bucket {} is versioned", bucket.name())));
    }
    Ok(())
}

/// One pending start per configured bucket, deduplicated by live bucket name.
pub async fn build_backups_to_start(
    configs: &BTreeMap<String, BucketConfig>,
    open_bucket: OpenBucket<'_>,
) -> Result<BTreeMap<String, BackupToStart>> {
    let mut backups_to_start = BTreeMap::new();

    for (id, config) in configs {
        let live_bucket = open_bucket(&config.name, &config.live_location())?;
        let backup_bucket = open_bucket(&config.backup.name, &config.backup_location())?;
        ensure_unversioned(live_bucket.as_ref()).await?;
        ensure_unversioned(backup_bucket.as_ref()).await?;

        debug!("Bucket {} backs up {} into {}", id, config.name, config.backup.name);
        backups_to_start.insert(
            id.clone(),
            BackupToStart::Pending {
                finder: Arc::new(LastBackupDirectoryFinder::new(Arc::clone(&backup_bucket))),
                bucket_pair: BackupBucketPair::new(live_bucket, backup_bucket),
            },
        );
    }

    Ok(mark_same_backups_to_start(backups_to_start))
}

/// Completion work recorded in the existing-blobs artifact of the start phase.
pub async fn build_backups_to_complete(
    configs: &BTreeMap<String, BucketConfig>,
    existing_blobs_artifact: &dyn Artifact<BucketBackup>,
    open_bucket: OpenBucket<'_>,
) -> Result<BTreeMap<String, BackupToComplete>> {
    let existing_blobs = existing_blobs_artifact.load()?;
    validate_references(&existing_blobs)?;

    for id in configs.keys() {
        if !existing_blobs.contains_key(id) {
            return Err(BackupError::Config(format!(
                "bucket {} is not present in the existing blobs artifact",
                id
            )));
        }
    }

    let mut backups_to_complete = BTreeMap::new();
    for (id, existing) in existing_blobs {
        if let Some(other) = existing.same_bucket_as {
            backups_to_complete.insert(id, BackupToComplete::SameAs(other));
            continue;
        }

        let config = configs.get(&id).ok_or_else(|| {
            BackupError::Config(format!(
                "bucket {} is present in the existing blobs artifact but not in the backup config",
                id
            ))
        })?;
        let backup_bucket = open_bucket(&config.backup.name, &config.backup_location())?;

        let blobs_to_copy = existing
            .blobs
            .into_iter()
            .map(|path| BackedUpBlob::new(path, existing.src_backup_directory_path.clone()))
            .collect();

        backups_to_complete.insert(
            id,
            BackupToComplete::Pending {
                backup_directory: BackupDirectory::new(existing.dst_backup_directory_path, backup_bucket),
                blobs_to_copy,
            },
        );
    }

    Ok(backups_to_complete)
}

/// Pairs each configured live bucket with the backup bucket named in the artifact.
///
/// IDs present only in the artifact are left for the restorer to reject.
pub async fn build_restore_bucket_pairs(
    configs: &BTreeMap<String, BucketConfig>,
    artifact: &dyn Artifact<BucketBackup>,
    open_bucket: OpenBucket<'_>,
) -> Result<BTreeMap<String, RestoreBucketPair>> {
    let backups = artifact.load()?;
    validate_references(&backups)?;

    let mut pairs = BTreeMap::new();
    for (id, config) in configs {
        let backup = backups.get(id).ok_or_else(|| {
            BackupError::Config(format!("cannot restore bucket {}, not found in backup artifact", id))
        })?;

        if let Some(other) = &backup.same_bucket_as {
            pairs.insert(id.clone(), RestoreBucketPair::SameAs(other.clone()));
            continue;
        }

        let live_bucket = open_bucket(&config.name, &config.live_location())?;
        let backup_bucket = open_bucket(&backup.bucket_name, &config.location_in(&backup.bucket_region))?;
        ensure_unversioned(live_bucket.as_ref()).await?;
        ensure_unversioned(backup_bucket.as_ref()).await?;

        pairs.insert(id.clone(), RestoreBucketPair::new(live_bucket, backup_bucket));
    }

    Ok(pairs)
}

/// Live container handles for a full-snapshot backup.
pub fn build_backup_containers(
    configs: &BTreeMap<String, ContainerConfig>,
    open_account: OpenAccount<'_>,
) -> Result<BTreeMap<String, Arc<dyn Container>>> {
    configs
        .iter()
        .map(|(id, config)| {
            let account = open_account(&config.storage_account, &config.storage_key)?;
            Ok((id.clone(), account.container(&config.name)?))
        })
        .collect()
}

/// Restore targets for a full-snapshot restore, honouring `restore_from`.
pub fn build_restore_targets(
    configs: &BTreeMap<String, ContainerConfig>,
    open_account: OpenAccount<'_>,
) -> Result<BTreeMap<String, RestoreTarget>> {
    configs
        .iter()
        .map(|(id, config)| {
            let account = open_account(&config.storage_account, &config.storage_key)?;
            let restore_from = config
                .restore_from
                .as_ref()
                .map(|from| open_account(&from.storage_account, &from.storage_key))
                .transpose()?;

            Ok((
                id.clone(),
                RestoreTarget {
                    container: account.container(&config.name)?,
                    account,
                    restore_from,
                },
            ))
        })
        .collect()
}

/// Full-snapshot backup of every configured container, tuned by `settings`.
pub fn snapshot_backuper(
    settings: &Settings,
    configs: &BTreeMap<String, ContainerConfig>,
    open_account: OpenAccount<'_>,
    artifact: Arc<dyn Artifact<ContainerBackup>>,
) -> Result<Backuper> {
    let containers = build_backup_containers(configs, open_account)?;
    Ok(Backuper::new(containers, artifact).with_retry(settings.retry_policy()))
}

/// Full-snapshot restore of every configured container, tuned by `settings`.
pub fn snapshot_restorer(
    settings: &Settings,
    configs: &BTreeMap<String, ContainerConfig>,
    open_account: OpenAccount<'_>,
    artifact: Arc<dyn Artifact<ContainerBackup>>,
) -> Result<Restorer> {
    let targets = build_restore_targets(configs, open_account)?;
    Ok(Restorer::new(targets, artifact)
        .with_executor(settings.executor())
        .with_retry(settings.retry_policy())
        .with_poll_interval(settings.poll_interval())
        .with_signed_url_ttl(settings.signed_url_ttl()))
}
