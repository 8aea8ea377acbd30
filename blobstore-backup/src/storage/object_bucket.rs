//! `Bucket` implementation over the `object_store` crate (S3, local filesystem, in-memory).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, PutPayload, WriteMultipart};
use tracing::{debug, info, warn};

use super::{Blob, BlobStream, Bucket};
use crate::blobpath::trim_trailing_delimiter;
use crate::retry::{retry, RetryPolicy};
use crate::utils::{BackupError, Result};

/// Where a bucket's objects live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Every bucket is a directory named after it under `root`.
    Local { root: PathBuf },
    S3 {
        region: String,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        endpoint: Option<String>,
        force_path_style: bool,
    },
}

impl StoreLocation {
    /// `file:///some/dir` endpoints select the local backend, anything else is S3.
    pub fn from_endpoint(
        endpoint: Option<&str>,
        region: &str,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> Self {
        match endpoint {
            Some(e) if e.starts_with("file://") => StoreLocation::Local {
                root: PathBuf::from(e.trim_start_matches("file://")),
            },
            _ => StoreLocation::S3 {
                region: region.to_string(),
                access_key_id,
                secret_access_key,
                endpoint: endpoint.filter(|e| !e.is_empty()).map(str::to_string),
                force_path_style,
            },
        }
    }
}

/// Build an object store for one bucket
pub fn build_object_store(location: &StoreLocation, bucket_name: &str) -> Result<Arc<dyn ObjectStore>> {
    match location {
        StoreLocation::Local { root } => {
            let dir = root.join(bucket_name);
            info!("Using local bucket directory: {}", dir.display());
            std::fs::create_dir_all(&dir)?;
            let store = LocalFileSystem::new_with_prefix(&dir)
                .map_err(|e| BackupError::storage(format!("failed to create local store for bucket '{}'", bucket_name), e))?;
            Ok(Arc::new(store))
        }
        StoreLocation::S3 {
            region,
            access_key_id,
            secret_access_key,
            endpoint,
            force_path_style,
        } => {
            info!("Using S3 bucket {} in region {}", bucket_name, region);

            let client_options = ClientOptions::new().with_timeout(std::time::Duration::from_secs(30));

            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(bucket_name)
                .with_region(region)
                .with_virtual_hosted_style_request(!force_path_style)
                .with_client_options(client_options);

            // Without explicit keys the builder falls back to the instance profile.
            if let (Some(key), Some(secret)) = (access_key_id, secret_access_key) {
                builder = builder
                    .with_access_key_id(key)
                    .with_secret_access_key(secret);
            }
            if let Some(endpoint) = endpoint {
                builder = builder.with_endpoint(endpoint);
                if endpoint.starts_with("http://") {
                    builder = builder.with_allow_http(true);
                }
            }

            let store = builder
                .build()
                .map_err(|e| BackupError::storage(format!("failed to build S3 client for bucket '{}'", bucket_name), e))?;
            Ok(Arc::new(store))
        }
    }
}

pub struct ObjectStoreBucket {
    name: String,
    region: String,
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    versioning_warned: AtomicBool,
}

/// Parts uploaded concurrently by one cross-bucket copy.
const MAX_PARTS_IN_FLIGHT: usize = 4;

impl ObjectStoreBucket {
    pub fn new(name: impl Into<String>, region: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            store,
            retry: RetryPolicy::default(),
            versioning_warned: AtomicBool::new(false),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn open(
        name: impl Into<String>,
        location: &StoreLocation,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let name = name.into();
        let store = build_object_store(location, &name)?;
        let region = match location {
            StoreLocation::Local { .. } => String::new(),
            StoreLocation::S3 { region, .. } => region.clone(),
        };
        Ok(Self::new(name, region, store).with_retry(retry))
    }

    fn object_path(path: &str) -> ObjectPath {
        ObjectPath::from(path)
    }
}

#[async_trait]
impl Bucket for ObjectStoreBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<Blob>> {
        let context = format!("failed listing blobs in bucket '{}'", self.name);
        let prefix = trim_trailing_delimiter(prefix);
        let prefix = (!prefix.is_empty()).then(|| Self::object_path(prefix));

        let metas = retry(self.retry, &context, || {
            let store = Arc::clone(&self.store);
            let prefix = prefix.clone();
            async move {
                let metas: Vec<_> = store.list(prefix.as_ref()).try_collect().await?;
                Ok(metas)
            }
        })
        .await?;

        // A copied object gets a fresh ETag (multipart and KMS uploads
        // differ from their copy), so blobs are matched by path only.
        Ok(metas
            .into_iter()
            .map(|meta| Blob::new(meta.location.to_string()))
            .collect())
    }

    async fn list_directories(&self) -> Result<Vec<String>> {
        let context = format!("failed listing directories in bucket '{}'", self.name);

        let listing = retry(self.retry, &context, || {
            let store = Arc::clone(&self.store);
            async move { Ok(store.list_with_delimiter(None).await?) }
        })
        .await?;

        Ok(listing
            .common_prefixes
            .into_iter()
            .map(|p| trim_trailing_delimiter(p.as_ref()).to_string())
            .collect())
    }

    async fn copy_blob_within_bucket(&self, src: &str, dst: &str) -> Result<()> {
        debug!("Copying {} to {} in bucket {}", src, dst, self.name);
        self.store
            .copy(&Self::object_path(src), &Self::object_path(dst))
            .await
            .map_err(|e| {
                BackupError::storage(
                    format!("failed to copy blob '{}' to '{}' in bucket '{}'", src, dst, self.name),
                    e,
                )
            })
    }

    async fn copy_blob_from_bucket(&self, source: &dyn Bucket, src: &str, dst: &str) -> Result<()> {
        debug!("Copying {}/{} to {}/{}", source.name(), src, self.name, dst);
        let context = || {
            format!(
                "failed to copy blob '{}' from bucket '{}' to '{}' in bucket '{}'",
                src,
                source.name(),
                dst,
                self.name
            )
        };
        let path = Self::object_path(dst);
        let mut chunks = source.read_blob_stream(src).await?;

        // Multipart uploads need at least one part.
        let Some(first) = chunks.try_next().await? else {
            return self
                .store
                .put(&path, PutPayload::new())
                .await
                .map(|_| ())
                .map_err(|e| BackupError::storage(context(), e));
        };

        let upload = self
            .store
            .put_multipart(&path)
            .await
            .map_err(|e| BackupError::storage(context(), e))?;
        let mut writer = WriteMultipart::new(upload);

        let streamed = async {
            writer.write(&first);
            while let Some(chunk) = chunks.try_next().await? {
                writer
                    .wait_for_capacity(MAX_PARTS_IN_FLIGHT)
                    .await
                    .map_err(|e| BackupError::storage(context(), e))?;
                writer.write(&chunk);
            }
            Ok::<(), BackupError>(())
        }
        .await;

        match streamed {
            Ok(()) => writer
                .finish()
                .await
                .map(|_| ())
                .map_err(|e| BackupError::storage(context(), e)),
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    warn!("Failed to abort upload of {} to bucket {}: {}", dst, self.name, abort);
                }
                Err(e)
            }
        }
    }

    async fn read_blob(&self, path: &str) -> Result<Bytes> {
        let context = || format!("failed to read blob '{}' in bucket '{}'", path, self.name);
        let result = self
            .store
            .get(&Self::object_path(path))
            .await
            .map_err(|e| BackupError::storage(context(), e))?;
        result.bytes().await.map_err(|e| BackupError::storage(context(), e))
    }

    async fn read_blob_stream(&self, path: &str) -> Result<BlobStream> {
        let context = format!("failed to read blob '{}' in bucket '{}'", path, self.name);
        let result = self
            .store
            .get(&Self::object_path(path))
            .await
            .map_err(|e| BackupError::storage(context.clone(), e))?;
        Ok(result
            .into_stream()
            .map_err(move |e| BackupError::storage(context.clone(), e))
            .boxed())
    }

    async fn upload_blob(&self, path: &str, contents: &str) -> Result<()> {
        self.store
            .put(&Self::object_path(path), PutPayload::from(contents.to_string()))
            .await
            .map(|_| ())
            .map_err(|e| {
                BackupError::storage(format!("failed to upload blob '{}' to bucket '{}'", path, self.name), e)
            })
    }

    async fn has_blob(&self, path: &str) -> Result<bool> {
        match self.store.head(&Self::object_path(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(BackupError::storage(
                format!("failed checking for blob '{}' in bucket '{}'", path, self.name),
                e,
            )),
        }
    }

    async fn is_versioned(&self) -> Result<bool> {
        // object_store exposes no bucket versioning configuration.
        if !self.versioning_warned.swap(true, Ordering::Relaxed) {
            warn!(
                "Cannot check versioning of bucket {}, assuming it is unversioned",
                self.name
            );
        }
        Ok(false)
    }
}
