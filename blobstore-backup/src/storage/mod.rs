//! Bucket capability contract used by the incremental engine.
//!
//! Engines only ever talk to `dyn Bucket`; pagination, credentials and the
//! details of server-side copies stay inside the implementations.

mod object_bucket;

pub use object_bucket::{build_object_store, ObjectStoreBucket, StoreLocation};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::fmt;

use crate::utils::Result;

/// Contents of one blob, chunk by chunk.
pub type BlobStream = BoxStream<'static, Result<Bytes>>;

/// One stored object, identified by its key and, where the backend offers
/// one that survives copies between buckets, a version token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Blob {
    pub path: String,
    pub version: Option<String>,
}

impl Blob {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: None,
        }
    }

    pub fn with_version(path: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: Some(version.into()),
        }
    }
}

impl fmt::Display for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.path, version),
            None => write!(f, "{}", self.path),
        }
    }
}

/// A storage container. Handles are shared between concurrent copy tasks, so
/// implementations must be safe to call from many tasks at once.
#[async_trait]
pub trait Bucket: Send + Sync {
    fn name(&self) -> &str;

    fn region(&self) -> &str;

    /// Lists every blob whose key starts with `prefix` (all blobs for `""`).
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<Blob>>;

    /// Lists the top-level "directories" (first key segments), without delimiter.
    async fn list_directories(&self) -> Result<Vec<String>>;

    async fn copy_blob_within_bucket(&self, src: &str, dst: &str) -> Result<()>;

    /// Copies `src` in `source` to `dst` in this bucket.
    async fn copy_blob_from_bucket(&self, source: &dyn Bucket, src: &str, dst: &str) -> Result<()>;

    async fn read_blob(&self, path: &str) -> Result<Bytes>;

    async fn read_blob_stream(&self, path: &str) -> Result<BlobStream>;

    async fn upload_blob(&self, path: &str, contents: &str) -> Result<()>;

    async fn has_blob(&self, path: &str) -> Result<bool>;

    async fn is_versioned(&self) -> Result<bool>;
}

impl fmt::Debug for dyn Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name())
            .field("region", &self.region())
            .finish()
    }
}
