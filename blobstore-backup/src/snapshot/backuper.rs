use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::info;

use super::container_url::sanitise;
use super::{Container, ContainerBackup};
use crate::artifact::Artifact;
use crate::retry::{retry, RetryPolicy};
use crate::utils::{BackupError, Result};

/// Records the current version of every blob in every configured container.
pub struct Backuper {
    containers: BTreeMap<String, Arc<dyn Container>>,
    artifact: Arc<dyn Artifact<ContainerBackup>>,
    retry: RetryPolicy,
}

impl Backuper {
    pub fn new(containers: BTreeMap<String, Arc<dyn Container>>, artifact: Arc<dyn Artifact<ContainerBackup>>) -> Self {
        Self {
            containers,
            artifact,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn run(&self) -> Result<()> {
        let backups = self.backup().await?;
        self.artifact.write(&backups)
    }

    /// Soft delete is checked on every container before any listing starts.
    pub async fn backup(&self) -> Result<BTreeMap<String, ContainerBackup>> {
        for (id, container) in &self.containers {
            if !container.soft_delete_enabled().await? {
                return Err(BackupError::Precondition(format!(
                    "soft delete is not enabled on the storage account of container {}",
                    id
                )));
            }
        }

        let mut first_id_by_url: HashMap<String, &str> = HashMap::new();
        let mut backups = BTreeMap::new();

        for (id, container) in &self.containers {
            let url = container.url();
            if let Some(first) = first_id_by_url.get(&url) {
                info!("Container {} is the same as {}, skipping", id, first);
                backups.insert(id.clone(), ContainerBackup::same_as(*first));
                continue;
            }
            first_id_by_url.insert(url.clone(), id);

            let context = format!("failed listing blobs in container '{}'", container.name());
            let blobs = retry(self.retry, &context, || container.list_blobs()).await?;

            if let Some(unversioned) = blobs.iter().find(|b| b.etag.is_empty() || b.etag == "null") {
                return Err(BackupError::Integrity(format!(
                    "blob '{}' in container '{}' has no version to pin",
                    unversioned.name,
                    sanitise(&url)
                )));
            }

            info!("Recorded {} blobs of container {}", blobs.len(), container.name());
            backups.insert(
                id.clone(),
                ContainerBackup {
                    name: container.name().to_string(),
                    blobs,
                    same_bucket_as: None,
                },
            );
        }

        Ok(backups)
    }
}
