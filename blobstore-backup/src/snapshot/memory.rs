//! In-process soft-delete cloud implementing [`Container`] and [`StorageAccount`].
//!
//! Models what the full-snapshot engine relies on from a real provider:
//! versioned blobs with ETags, soft delete keeping overwritten and deleted
//! versions, undelete, time-limited signed access across accounts and
//! asynchronous copies whose status has to be polled. Listing failures, copy
//! failures and copy latency can be injected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use url::Url;
use uuid::Uuid;

use super::{BlobId, Container, CopyStatus, RetainedBlob, StorageAccount};
use crate::utils::{BackupError, Result};

const SCHEME: &str = "memory";

#[derive(Debug, Clone)]
struct StoredBlob {
    name: String,
    etag: String,
    contents: Bytes,
    snapshot: Option<String>,
    deleted: bool,
}

#[derive(Debug)]
struct PendingCopy {
    remaining_polls: usize,
    contents: Bytes,
    outcome: CopyStatus,
}

#[derive(Debug, Default)]
struct ContainerState {
    blobs: Vec<StoredBlob>,
    copies: HashMap<String, PendingCopy>,
}

#[derive(Debug, Default)]
struct AccountState {
    soft_delete: bool,
    containers: HashMap<String, ContainerState>,
    signatures_issued: usize,
}

#[derive(Debug)]
struct Signature {
    account: String,
    container: String,
    expires_at: DateTime<Utc>,
}

type ContainerKey = (String, String);

#[derive(Debug, Default)]
struct CloudState {
    accounts: HashMap<String, AccountState>,
    signatures: HashMap<String, Signature>,
    snapshot_seq: u64,

    copy_latency: usize,
    failing_copies: HashMap<ContainerKey, CopyStatus>,
    list_failures: HashMap<ContainerKey, (usize, String)>,

    list_calls: HashMap<ContainerKey, usize>,
    copies_started: usize,
    status_polls: usize,
}

fn key(account: &str, container: &str) -> ContainerKey {
    (account.to_string(), container.to_string())
}

fn new_etag() -> String {
    let hex = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("0x{}", &hex[..15])
}

impl CloudState {
    fn container(&self, account: &str, container: &str) -> Result<&ContainerState> {
        self.accounts
            .get(account)
            .ok_or_else(|| BackupError::Remote(format!("storage account '{}' does not exist", account)))?
            .containers
            .get(container)
            .ok_or_else(|| BackupError::Remote(format!("container '{}' does not exist", container)))
    }

    fn container_mut(&mut self, account: &str, container: &str) -> Result<&mut ContainerState> {
        self.accounts
            .get_mut(account)
            .ok_or_else(|| BackupError::Remote(format!("storage account '{}' does not exist", account)))?
            .containers
            .get_mut(container)
            .ok_or_else(|| BackupError::Remote(format!("container '{}' does not exist", container)))
    }

    fn soft_delete(&self, account: &str) -> bool {
        self.accounts.get(account).is_some_and(|a| a.soft_delete)
    }

    fn next_snapshot(&mut self) -> String {
        self.snapshot_seq += 1;
        format!(
            "{}.{:07}Z",
            Utc::now().format("%Y-%m-%dT%H:%M:%S"),
            self.snapshot_seq % 10_000_000
        )
    }

    /// Writes a new current version, keeping the previous one as a deleted
    /// snapshot when soft delete is on.
    fn write_blob(&mut self, account: &str, container: &str, name: &str, contents: Bytes, etag: String) -> Result<()> {
        let soft_delete = self.soft_delete(account);
        let snapshot = self.next_snapshot();
        let state = self.container_mut(account, container)?;

        if soft_delete {
            for blob in state.blobs.iter_mut().filter(|b| b.name == name && b.snapshot.is_none()) {
                blob.snapshot = Some(snapshot.clone());
                blob.deleted = true;
            }
        } else {
            state.blobs.retain(|b| !(b.name == name && b.snapshot.is_none()));
        }

        state.blobs.push(StoredBlob {
            name: name.to_string(),
            etag,
            contents,
            snapshot: None,
            deleted: false,
        });
        Ok(())
    }

    fn delete_blob(&mut self, account: &str, container: &str, name: &str) -> Result<()> {
        let soft_delete = self.soft_delete(account);
        let state = self.container_mut(account, container)?;

        if soft_delete {
            for blob in state
                .blobs
                .iter_mut()
                .filter(|b| b.name == name && b.snapshot.is_none())
            {
                blob.deleted = true;
            }
        } else {
            state.blobs.retain(|b| b.name != name);
        }
        Ok(())
    }

    fn record_listing(&mut self, account: &str, container: &str) -> Result<()> {
        let k = key(account, container);
        *self.list_calls.entry(k.clone()).or_default() += 1;

        if let Some((remaining, message)) = self.list_failures.get_mut(&k) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackupError::Remote(message.clone()));
            }
        }
        Ok(())
    }

    fn check_signature(&self, token: &str, account: &str, container: &str) -> Result<()> {
        match self.signatures.get(token) {
            Some(sig) if sig.account == account && sig.container == container && sig.expires_at > Utc::now() => Ok(()),
            Some(sig) if sig.expires_at <= Utc::now() => Err(BackupError::Remote(format!(
                "signature for container '{}' expired at {}",
                container, sig.expires_at
            ))),
            _ => Err(BackupError::Remote(format!(
                "not authorised to access container '{}' of storage account '{}'",
                container, account
            ))),
        }
    }
}

/// Shared handle to the simulated cloud. Clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCloud {
    inner: Arc<Mutex<CloudState>>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_account(&self, name: &str, soft_delete: bool) {
        self.state().accounts.entry(name.to_string()).or_default().soft_delete = soft_delete;
    }

    pub fn set_soft_delete(&self, account: &str, enabled: bool) {
        self.create_account(account, enabled);
    }

    pub fn create_container(&self, account: &str, container: &str) {
        self.state()
            .accounts
            .entry(account.to_string())
            .or_default()
            .containers
            .entry(container.to_string())
            .or_default();
    }

    pub fn account(&self, name: &str) -> MemoryAccount {
        MemoryAccount {
            cloud: self.clone(),
            name: name.to_string(),
        }
    }

    /// Uploads a blob and returns its new ETag.
    pub fn put_blob(&self, account: &str, container: &str, name: &str, contents: &str) -> String {
        let etag = new_etag();
        self.put_blob_with_etag(account, container, name, contents, &etag);
        etag
    }

    pub fn put_blob_with_etag(&self, account: &str, container: &str, name: &str, contents: &str, etag: &str) {
        self.create_container(account, container);
        // The container exists now, so the write cannot fail.
        let _ = self.state().write_blob(
            account,
            container,
            name,
            Bytes::from(contents.to_string()),
            etag.to_string(),
        );
    }

    pub fn delete_blob(&self, account: &str, container: &str, name: &str) {
        let _ = self.state().delete_blob(account, container, name);
    }

    /// Contents of the current version of `name`, if there is one.
    pub fn read_blob(&self, account: &str, container: &str, name: &str) -> Option<Bytes> {
        let state = self.state();
        state
            .container(account, container)
            .ok()?
            .blobs
            .iter()
            .find(|b| b.name == name && b.snapshot.is_none() && !b.deleted)
            .map(|b| b.contents.clone())
    }

    /// Fails the next `times` listings of the container with `message`.
    pub fn fail_listings(&self, account: &str, container: &str, times: usize, message: &str) {
        self.state()
            .list_failures
            .insert(key(account, container), (times, message.to_string()));
    }

    /// Every copy into the container finishes with `status` instead of success.
    pub fn fail_copies_into(&self, account: &str, container: &str, status: CopyStatus) {
        self.state().failing_copies.insert(key(account, container), status);
    }

    /// Number of status polls a copy stays pending for.
    pub fn set_copy_latency(&self, polls: usize) {
        self.state().copy_latency = polls;
    }

    pub fn list_calls(&self, account: &str, container: &str) -> usize {
        self.state()
            .list_calls
            .get(&key(account, container))
            .copied()
            .unwrap_or(0)
    }

    pub fn copies_started(&self) -> usize {
        self.state().copies_started
    }

    pub fn status_polls(&self) -> usize {
        self.state().status_polls
    }

    pub fn signatures_issued(&self, account: &str) -> usize {
        self.state()
            .accounts
            .get(account)
            .map(|a| a.signatures_issued)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryAccount {
    cloud: MemoryCloud,
    name: String,
}

#[async_trait]
impl StorageAccount for MemoryAccount {
    fn name(&self) -> &str {
        &self.name
    }

    fn container(&self, name: &str) -> Result<Arc<dyn Container>> {
        self.cloud.state().container(&self.name, name)?;
        Ok(Arc::new(MemoryContainer {
            cloud: self.cloud.clone(),
            account: self.name.clone(),
            name: name.to_string(),
            signature: None,
        }))
    }

    async fn signed_container(&self, name: &str, ttl: Duration) -> Result<Arc<dyn Container>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| BackupError::storage(format!("invalid signature lifetime for container '{}'", name), e))?;

        let token = Uuid::new_v4().simple().to_string();
        {
            let mut state = self.cloud.state();
            state.container(&self.name, name)?;
            state.signatures.insert(
                token.clone(),
                Signature {
                    account: self.name.clone(),
                    container: name.to_string(),
                    expires_at: Utc::now() + ttl,
                },
            );
            if let Some(account) = state.accounts.get_mut(&self.name) {
                account.signatures_issued += 1;
            }
        }

        Ok(Arc::new(MemoryContainer {
            cloud: self.cloud.clone(),
            account: self.name.clone(),
            name: name.to_string(),
            signature: Some(token),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct MemoryContainer {
    cloud: MemoryCloud,
    account: String,
    name: String,
    signature: Option<String>,
}

impl MemoryContainer {
    fn build_url(&self, blob: Option<&str>, snapshot: Option<&str>) -> String {
        let base = match blob {
            Some(blob) => format!("{}://{}/{}/{}", SCHEME, self.account, self.name, blob),
            None => format!("{}://{}/{}", SCHEME, self.account, self.name),
        };
        let Ok(mut url) = Url::parse(&base) else {
            return base;
        };

        if snapshot.is_some() || self.signature.is_some() {
            let mut query = url.query_pairs_mut();
            if let Some(snapshot) = snapshot {
                query.append_pair("snapshot", snapshot);
            }
            if let Some(signature) = &self.signature {
                query.append_pair("sig", signature);
            }
        }
        url.to_string()
    }

    fn authorise(&self, state: &CloudState) -> Result<()> {
        match &self.signature {
            Some(token) => state.check_signature(token, &self.account, &self.name),
            None => Ok(()),
        }
    }
}

/// Source of a copy, resolved from a blob URL.
struct CopySource {
    account: String,
    container: String,
    blob: String,
    snapshot: Option<String>,
    signature: Option<String>,
}

fn parse_source_url(source_url: &str) -> Result<CopySource> {
    let invalid = || BackupError::Remote(format!("invalid copy source '{}'", source_url));

    let url = Url::parse(source_url).map_err(|_| invalid())?;
    if url.scheme() != SCHEME {
        return Err(invalid());
    }
    let account = url.host_str().ok_or_else(invalid)?.to_string();
    let (container, blob) = url.path().trim_start_matches('/').split_once('/').ok_or_else(invalid)?;

    let mut snapshot = None;
    let mut signature = None;
    for (k, v) in url.query_pairs() {
        match k.as_ref() {
            "snapshot" => snapshot = Some(v.into_owned()),
            "sig" => signature = Some(v.into_owned()),
            _ => {}
        }
    }

    Ok(CopySource {
        account,
        container: container.to_string(),
        blob: blob.to_string(),
        snapshot,
        signature,
    })
}

#[async_trait]
impl Container for MemoryContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> String {
        self.build_url(None, None)
    }

    async fn soft_delete_enabled(&self) -> Result<bool> {
        let state = self.cloud.state();
        state
            .accounts
            .get(&self.account)
            .map(|a| a.soft_delete)
            .ok_or_else(|| {
                BackupError::Remote(format!(
                    "failed fetching properties for storage account '{}'",
                    self.account
                ))
            })
    }

    async fn list_blobs(&self) -> Result<Vec<BlobId>> {
        let mut state = self.cloud.state();
        self.authorise(&state)?;
        state.record_listing(&self.account, &self.name)?;

        let mut blobs: Vec<BlobId> = state
            .container(&self.account, &self.name)?
            .blobs
            .iter()
            .filter(|b| b.snapshot.is_none() && !b.deleted)
            .map(|b| BlobId::new(b.name.clone(), b.etag.clone()))
            .collect();
        blobs.sort();
        Ok(blobs)
    }

    async fn list_retained_blobs(&self) -> Result<Vec<RetainedBlob>> {
        let mut state = self.cloud.state();
        self.authorise(&state)?;
        state.record_listing(&self.account, &self.name)?;

        Ok(state
            .container(&self.account, &self.name)?
            .blobs
            .iter()
            .map(|b| RetainedBlob {
                id: BlobId::new(b.name.clone(), b.etag.clone()),
                snapshot: b.snapshot.clone(),
                deleted: b.deleted,
            })
            .collect())
    }

    async fn undelete_blob(&self, name: &str) -> Result<()> {
        let mut state = self.cloud.state();
        self.authorise(&state)?;

        let container = state.container_mut(&self.account, &self.name)?;
        for blob in container.blobs.iter_mut().filter(|b| b.name == name) {
            blob.deleted = false;
        }
        Ok(())
    }

    fn blob_url(&self, blob: &RetainedBlob) -> String {
        self.build_url(Some(&blob.id.name), blob.snapshot.as_deref())
    }

    async fn start_copy_from_url(&self, source_url: &str, name: &str) -> Result<CopyStatus> {
        let mut state = self.cloud.state();
        state.copies_started += 1;

        let source = parse_source_url(source_url)?;
        if source.account != self.account {
            match &source.signature {
                Some(token) => state.check_signature(token, &source.account, &source.container)?,
                None => {
                    return Err(BackupError::Remote(format!(
                        "not authorised to read container '{}' of storage account '{}'",
                        source.container, source.account
                    )))
                }
            }
        }

        let contents = state
            .container(&source.account, &source.container)?
            .blobs
            .iter()
            .find(|b| b.name == source.blob && b.snapshot == source.snapshot && !b.deleted)
            .map(|b| b.contents.clone())
            .ok_or_else(|| BackupError::Remote(format!("copy source '{}' not found", source_url)))?;

        let outcome = state
            .failing_copies
            .get(&key(&self.account, &self.name))
            .copied()
            .unwrap_or(CopyStatus::Success);
        let latency = state.copy_latency;

        if latency == 0 {
            if outcome == CopyStatus::Success {
                state.write_blob(&self.account, &self.name, name, contents, new_etag())?;
            }
            return Ok(outcome);
        }

        state.container_mut(&self.account, &self.name)?.copies.insert(
            name.to_string(),
            PendingCopy {
                remaining_polls: latency,
                contents,
                outcome,
            },
        );
        Ok(CopyStatus::Pending)
    }

    async fn copy_status(&self, name: &str) -> Result<CopyStatus> {
        let mut state = self.cloud.state();
        state.status_polls += 1;

        let container = state.container_mut(&self.account, &self.name)?;
        let copy = container
            .copies
            .get_mut(name)
            .ok_or_else(|| BackupError::Remote(format!("no copy in progress for blob '{}'", name)))?;

        copy.remaining_polls = copy.remaining_polls.saturating_sub(1);
        if copy.remaining_polls > 0 {
            return Ok(CopyStatus::Pending);
        }

        let Some(copy) = container.copies.remove(name) else {
            return Ok(CopyStatus::Pending);
        };
        if copy.outcome == CopyStatus::Success {
            state.write_blob(&self.account, &self.name, name, copy.contents, new_etag())?;
        }
        Ok(copy.outcome)
    }
}
