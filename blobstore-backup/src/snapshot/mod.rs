//! Full-snapshot backup for soft-delete capable containers.
//!
//! Nothing is copied at backup time. The artifact records the current
//! `(name, etag)` of every blob and the provider's soft-delete retention keeps
//! that content around; a restore undeletes exactly those versions and copies
//! them back over the live blobs.

mod backuper;
pub mod container_url;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
mod restorer;

pub use backuper::Backuper;
pub use restorer::{RestoreTarget, Restorer, DEFAULT_POLL_INTERVAL, DEFAULT_SIGNED_URL_TTL};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::artifact::Record;
use crate::utils::Result;

/// A blob pinned to one version of its content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId {
    pub name: String,
    pub etag: String,
}

impl BlobId {
    pub fn new(name: impl Into<String>, etag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            etag: etag.into(),
        }
    }
}

/// A blob as seen when listing deleted blobs and snapshots too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedBlob {
    pub id: BlobId,
    /// Set for earlier versions kept by soft delete.
    pub snapshot: Option<String>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    Pending,
    Success,
    Aborted,
    Failed,
}

impl fmt::Display for CopyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            CopyStatus::Pending => "pending",
            CopyStatus::Success => "success",
            CopyStatus::Aborted => "aborted",
            CopyStatus::Failed => "failed",
        };
        f.write_str(status)
    }
}

/// One container's entry in the snapshot artifact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerBackup {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blobs: Vec<BlobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_bucket_as: Option<String>,
}

impl ContainerBackup {
    pub fn same_as(container_id: impl Into<String>) -> Self {
        Self {
            same_bucket_as: Some(container_id.into()),
            ..Self::default()
        }
    }
}

impl Record for ContainerBackup {
    fn same_as(&self) -> Option<&str> {
        self.same_bucket_as.as_deref()
    }

    fn has_primary_fields(&self) -> bool {
        !self.name.is_empty() || !self.blobs.is_empty()
    }
}

/// Capabilities of a soft-delete capable container.
///
/// Handles are shared between concurrent copy tasks.
#[async_trait]
pub trait Container: Send + Sync {
    fn name(&self) -> &str;

    /// Fully qualified URL; may carry a signature in its query.
    fn url(&self) -> String;

    async fn soft_delete_enabled(&self) -> Result<bool>;

    /// Current blobs only.
    async fn list_blobs(&self) -> Result<Vec<BlobId>>;

    /// Current blobs plus deleted blobs and snapshots.
    async fn list_retained_blobs(&self) -> Result<Vec<RetainedBlob>>;

    /// Restores every soft-deleted version of `name`.
    async fn undelete_blob(&self, name: &str) -> Result<()>;

    /// URL reading exactly `blob`'s version, usable as a copy source.
    fn blob_url(&self, blob: &RetainedBlob) -> String;

    /// Starts a server-side copy of `source_url` into blob `name` of this container.
    async fn start_copy_from_url(&self, source_url: &str, name: &str) -> Result<CopyStatus>;

    async fn copy_status(&self, name: &str) -> Result<CopyStatus>;
}

#[async_trait]
pub trait StorageAccount: Send + Sync {
    fn name(&self) -> &str;

    fn container(&self, name: &str) -> Result<Arc<dyn Container>>;

    /// Container handle authorised by a signature valid for `ttl`, for reading
    /// from an account other than the destination's.
    async fn signed_container(&self, name: &str, ttl: Duration) -> Result<Arc<dyn Container>>;
}
