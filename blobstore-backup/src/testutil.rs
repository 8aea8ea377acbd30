//! Hand-written test doubles shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};

use crate::artifact::Artifact;
use crate::incremental::Clock;
use crate::storage::{Blob, BlobStream, Bucket};
use crate::utils::{BackupError, Result};

fn injected(message: &str) -> BackupError {
    BackupError::Remote(message.to_string())
}

#[derive(Default)]
struct FakeBucketState {
    blobs: BTreeMap<String, (Option<String>, Bytes)>,
    versioned: bool,

    list_blobs_calls: Vec<String>,
    list_directories_calls: usize,
    copies_within: Vec<(String, String)>,
    copies_from: Vec<(String, String, String)>,
    uploads: Vec<(String, String)>,

    list_blobs_error: Option<String>,
    list_directories_error: Option<String>,
    copy_errors: HashMap<String, String>,
    copy_all_error: Option<String>,
    upload_error: Option<String>,
    has_blob_error: Option<String>,
}

/// In-memory bucket that records every call and can be told to fail.
pub struct FakeBucket {
    name: String,
    region: String,
    state: Mutex<FakeBucketState>,
}

impl FakeBucket {
    pub fn new(name: &str) -> Arc<Self> {
        Self::in_region(name, "us-east-1")
    }

    pub fn in_region(name: &str, region: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            region: region.to_string(),
            state: Mutex::new(FakeBucketState::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeBucketState> {
        self.state.lock().unwrap()
    }

    pub fn put(&self, path: &str, version: Option<&str>) {
        self.state()
            .blobs
            .insert(path.to_string(), (version.map(str::to_string), Bytes::from(path.to_string())));
    }

    pub fn paths(&self) -> Vec<String> {
        self.state().blobs.keys().cloned().collect()
    }

    pub fn set_versioned(&self, versioned: bool) {
        self.state().versioned = versioned;
    }

    pub fn fail_list_blobs(&self, message: &str) {
        self.state().list_blobs_error = Some(message.to_string());
    }

    pub fn fail_list_directories(&self, message: &str) {
        self.state().list_directories_error = Some(message.to_string());
    }

    /// Fails copies whose source path is `src`.
    pub fn fail_copy_of(&self, src: &str, message: &str) {
        self.state().copy_errors.insert(src.to_string(), message.to_string());
    }

    pub fn fail_all_copies(&self, message: &str) {
        self.state().copy_all_error = Some(message.to_string());
    }

    pub fn fail_uploads(&self, message: &str) {
        self.state().upload_error = Some(message.to_string());
    }

    pub fn fail_has_blob(&self, message: &str) {
        self.state().has_blob_error = Some(message.to_string());
    }

    pub fn list_blobs_calls(&self) -> Vec<String> {
        self.state().list_blobs_calls.clone()
    }

    pub fn list_directories_calls(&self) -> usize {
        self.state().list_directories_calls
    }

    pub fn copies_within(&self) -> Vec<(String, String)> {
        let mut copies = self.state().copies_within.clone();
        copies.sort();
        copies
    }

    /// `(source bucket, src, dst)` for every cross-bucket copy into this bucket.
    pub fn copies_from(&self) -> Vec<(String, String, String)> {
        let mut copies = self.state().copies_from.clone();
        copies.sort();
        copies
    }

    pub fn uploads(&self) -> Vec<(String, String)> {
        self.state().uploads.clone()
    }

    pub fn copy_count(&self) -> usize {
        let state = self.state();
        state.copies_within.len() + state.copies_from.len()
    }

    fn copy_error(&self, src: &str) -> Option<BackupError> {
        let state = self.state();
        state
            .copy_errors
            .get(src)
            .or(state.copy_all_error.as_ref())
            .map(|m| injected(m))
    }
}

fn under_prefix(path: &str, prefix: &str) -> bool {
    prefix.is_empty() || path == prefix || crate::blobpath::trim_prefix(path, prefix).is_some()
}

#[async_trait]
impl Bucket for FakeBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<Blob>> {
        let mut state = self.state();
        state.list_blobs_calls.push(prefix.to_string());
        if let Some(message) = &state.list_blobs_error {
            return Err(injected(message));
        }
        Ok(state
            .blobs
            .iter()
            .filter(|(path, _)| under_prefix(path, prefix))
            .map(|(path, (version, _))| Blob {
                path: path.clone(),
                version: version.clone(),
            })
            .collect())
    }

    async fn list_directories(&self) -> Result<Vec<String>> {
        let mut state = self.state();
        state.list_directories_calls += 1;
        if let Some(message) = &state.list_directories_error {
            return Err(injected(message));
        }
        let mut dirs: Vec<String> = state
            .blobs
            .keys()
            .filter_map(|path| path.split_once('/').map(|(dir, _)| dir.to_string()))
            .collect();
        dirs.dedup();
        Ok(dirs)
    }

    async fn copy_blob_within_bucket(&self, src: &str, dst: &str) -> Result<()> {
        self.state()
            .copies_within
            .push((src.to_string(), dst.to_string()));
        if let Some(e) = self.copy_error(src) {
            return Err(e);
        }
        let mut state = self.state();
        let entry = state
            .blobs
            .get(src)
            .cloned()
            .ok_or_else(|| injected(&format!("no such blob {}", src)))?;
        state.blobs.insert(dst.to_string(), entry);
        Ok(())
    }

    async fn copy_blob_from_bucket(&self, source: &dyn Bucket, src: &str, dst: &str) -> Result<()> {
        self.state()
            .copies_from
            .push((source.name().to_string(), src.to_string(), dst.to_string()));
        if let Some(e) = self.copy_error(src) {
            return Err(e);
        }
        let contents = source.read_blob(src).await?;
        self.state().blobs.insert(dst.to_string(), (None, contents));
        Ok(())
    }

    async fn read_blob(&self, path: &str) -> Result<Bytes> {
        self.state()
            .blobs
            .get(path)
            .map(|(_, contents)| contents.clone())
            .ok_or_else(|| injected(&format!("no such blob {}", path)))
    }

    async fn read_blob_stream(&self, path: &str) -> Result<BlobStream> {
        let contents = self.read_blob(path).await?;
        Ok(stream::once(async move { Ok::<_, BackupError>(contents) }).boxed())
    }

    async fn upload_blob(&self, path: &str, contents: &str) -> Result<()> {
        let mut state = self.state();
        state.uploads.push((path.to_string(), contents.to_string()));
        if let Some(message) = &state.upload_error {
            return Err(injected(message));
        }
        state
            .blobs
            .insert(path.to_string(), (None, Bytes::from(contents.to_string())));
        Ok(())
    }

    async fn has_blob(&self, path: &str) -> Result<bool> {
        let state = self.state();
        if let Some(message) = &state.has_blob_error {
            return Err(injected(message));
        }
        Ok(state.blobs.contains_key(path))
    }

    async fn is_versioned(&self) -> Result<bool> {
        Ok(self.state().versioned)
    }
}

/// Artifact double holding records in memory.
pub struct FakeArtifact<T> {
    stored: Mutex<Option<BTreeMap<String, T>>>,
    write_error: Mutex<Option<String>>,
    load_error: Mutex<Option<String>>,
    writes: Mutex<usize>,
}

impl<T: Clone> FakeArtifact<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stored: Mutex::new(None),
            write_error: Mutex::new(None),
            load_error: Mutex::new(None),
            writes: Mutex::new(0),
        })
    }

    pub fn with_records(records: BTreeMap<String, T>) -> Arc<Self> {
        let artifact = Self::new();
        *artifact.stored.lock().unwrap() = Some(records);
        artifact
    }

    pub fn fail_writes(&self, message: &str) {
        *self.write_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_loads(&self, message: &str) {
        *self.load_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn written(&self) -> Option<BTreeMap<String, T>> {
        self.stored.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap()
    }
}

impl<T: Clone + Send> Artifact<T> for FakeArtifact<T> {
    fn write(&self, records: &BTreeMap<String, T>) -> Result<()> {
        *self.writes.lock().unwrap() += 1;
        if let Some(message) = self.write_error.lock().unwrap().as_deref() {
            return Err(injected(message));
        }
        *self.stored.lock().unwrap() = Some(records.clone());
        Ok(())
    }

    fn load(&self) -> Result<BTreeMap<String, T>> {
        if let Some(message) = self.load_error.lock().unwrap().as_deref() {
            return Err(injected(message));
        }
        Ok(self.stored.lock().unwrap().clone().unwrap_or_default())
    }
}

/// Clock frozen at one timestamp.
pub struct FakeClock(pub &'static str);

impl Clock for FakeClock {
    fn now(&self) -> String {
        self.0.to_string()
    }
}
