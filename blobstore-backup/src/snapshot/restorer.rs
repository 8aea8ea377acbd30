use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::container_url::sanitise;
use super::{BlobId, Container, ContainerBackup, CopyStatus, RetainedBlob, StorageAccount};
use crate::artifact::Artifact;
use crate::executor::{operation, ParallelExecutor};
use crate::retry::{retry, RetryPolicy};
use crate::utils::{BackupError, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_SIGNED_URL_TTL: Duration = Duration::from_secs(60 * 60);

/// Where one configured container is restored to, and where it is read from.
pub struct RestoreTarget {
    pub container: Arc<dyn Container>,
    /// Account of `container`; the source is read from here by default.
    pub account: Arc<dyn StorageAccount>,
    /// Alternate account holding the backed-up container.
    pub restore_from: Option<Arc<dyn StorageAccount>>,
}

pub struct Restorer {
    targets: BTreeMap<String, RestoreTarget>,
    artifact: Arc<dyn Artifact<ContainerBackup>>,
    executor: ParallelExecutor,
    retry: RetryPolicy,
    poll_interval: Duration,
    signed_url_ttl: Duration,
}

impl Restorer {
    pub fn new(targets: BTreeMap<String, RestoreTarget>, artifact: Arc<dyn Artifact<ContainerBackup>>) -> Self {
        Self {
            targets,
            artifact,
            executor: ParallelExecutor::default(),
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            signed_url_ttl: DEFAULT_SIGNED_URL_TTL,
        }
    }

    pub fn with_executor(mut self, executor: ParallelExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_signed_url_ttl(mut self, ttl: Duration) -> Self {
        self.signed_url_ttl = ttl;
        self
    }

    /// Validates the artifact against the targets, soft delete on every
    /// target and every pinned version, then restores container by container.
    /// The first failing container ends the run.
    pub async fn run(&self) -> Result<()> {
        let backups = self.artifact.load()?;

        for id in self.targets.keys() {
            if !backups.contains_key(id) {
                return Err(BackupError::Config(format!(
                    "container {} is mentioned in the restore config but is not recorded in the artifact",
                    id
                )));
            }
        }
        for id in backups.keys() {
            if !self.targets.contains_key(id) {
                return Err(BackupError::Config(format!(
                    "container {} is not mentioned in the restore config but is present in the artifact",
                    id
                )));
            }
        }

        for (id, target) in &self.targets {
            if !target.container.soft_delete_enabled().await? {
                return Err(BackupError::Precondition(format!(
                    "soft delete is not enabled on the storage account of container {}",
                    id
                )));
            }
        }

        let mut plans = Vec::with_capacity(backups.len());
        for (id, backup) in &backups {
            if backup.same_bucket_as.is_some() || backup.blobs.is_empty() {
                debug!("Nothing to restore for container {}", id);
                continue;
            }

            let target = &self.targets[id];
            let source = match &target.restore_from {
                Some(account) => {
                    info!("Restoring container {} from storage account {}", id, account.name());
                    account.signed_container(&backup.name, self.signed_url_ttl).await?
                }
                None => target.account.container(&backup.name)?,
            };

            plans.push(self.plan(source, Arc::clone(&target.container), &backup.blobs).await?);
        }

        for plan in plans {
            let count = plan.blobs.len();
            let destination = plan.destination.name().to_string();
            self.copy_blobs(plan).await?;
            info!("Restored {} blobs into container {}", count, destination);
        }

        Ok(())
    }

    /// Pins every recorded blob to a retained version of `source`.
    async fn plan(
        &self,
        source: Arc<dyn Container>,
        destination: Arc<dyn Container>,
        blobs: &[BlobId],
    ) -> Result<ContainerRestore> {
        let source_url = sanitise(&source.url());

        let context = format!("failed listing blobs in container '{}'", source.name());
        let retained = retry(self.retry, &context, || source.list_retained_blobs()).await?;

        let mut by_id: HashMap<BlobId, RetainedBlob> = HashMap::with_capacity(retained.len());
        for blob in retained {
            by_id.entry(blob.id.clone()).or_insert(blob);
        }

        let mut pinned = Vec::with_capacity(blobs.len());
        for id in blobs {
            let Some(blob) = by_id.remove(id) else {
                return Err(BackupError::Integrity(format!(
                    "no \"{}\" blob with \"{}\" ETag found in container \"{}\"",
                    id.name, id.etag, source_url
                )));
            };
            pinned.push(blob);
        }

        Ok(ContainerRestore {
            source,
            source_url,
            destination,
            blobs: pinned,
        })
    }

    async fn copy_blobs(&self, plan: ContainerRestore) -> Result<()> {
        let ContainerRestore {
            source,
            source_url,
            destination,
            blobs,
        } = plan;

        let copies = blobs
            .into_iter()
            .map(|blob| {
                let source = Arc::clone(&source);
                let destination = Arc::clone(&destination);
                let source_url = source_url.clone();
                let poll_interval = self.poll_interval;
                operation(async move {
                    copy_blob(source.as_ref(), destination.as_ref(), &blob, &source_url, poll_interval).await
                })
            })
            .collect();

        let errors = self.executor.run_batch(copies).await;
        if !errors.is_empty() {
            return Err(BackupError::aggregate(
                format!(
                    "failed to copy blob from container \"{}\" to \"{}\"",
                    source_url,
                    destination.name()
                ),
                errors,
            ));
        }

        Ok(())
    }
}

/// One container's copies, with every source version already resolved.
struct ContainerRestore {
    source: Arc<dyn Container>,
    source_url: String,
    destination: Arc<dyn Container>,
    blobs: Vec<RetainedBlob>,
}

async fn copy_blob(
    source: &dyn Container,
    destination: &dyn Container,
    blob: &RetainedBlob,
    source_url: &str,
    poll_interval: Duration,
) -> Result<()> {
    source.undelete_blob(&blob.id.name).await?;

    let mut status = destination
        .start_copy_from_url(&source.blob_url(blob), &blob.id.name)
        .await?;

    while status == CopyStatus::Pending {
        debug!("Copy of {} into {} pending", blob.id.name, destination.name());
        tokio::time::sleep(poll_interval).await;
        status = destination.copy_status(&blob.id.name).await?;
    }

    if status != CopyStatus::Success {
        return Err(BackupError::CopyFailed {
            blob: blob.id.name.clone(),
            from_container: source_url.to_string(),
            to_container: destination.name().to_string(),
            status: status.to_string(),
        });
    }

    Ok(())
}
