//! Configuration for backup and restore runs.
//!
//! Container configuration is a JSON object keyed by logical container ID.
//! Process settings come from defaults overridden by `BLOBSTORE_BACKUP_*`
//! environment variables.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::executor::{ParallelExecutor, DEFAULT_MAX_IN_FLIGHT};
use crate::retry::RetryPolicy;
use crate::snapshot::{DEFAULT_POLL_INTERVAL, DEFAULT_SIGNED_URL_TTL};
use crate::storage::StoreLocation;
use crate::utils::{BackupError, Result};

const ENV_PREFIX: &str = "BLOBSTORE_BACKUP";

/// A live bucket and the bucket its incremental backups go to.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct BucketConfig {
    pub name: String,
    pub region: String,
    #[serde(default)]
    pub aws_access_key_id: String,
    #[serde(default)]
    pub aws_secret_access_key: String,
    /// Custom S3 endpoint, or `file:///root` for buckets kept as local directories.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub use_iam_profile: bool,
    #[serde(default)]
    pub force_path_style: bool,
    pub backup: BackupBucketConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackupBucketConfig {
    pub name: String,
    pub region: String,
}

impl BucketConfig {
    pub fn live_location(&self) -> StoreLocation {
        self.location_in(&self.region)
    }

    pub fn backup_location(&self) -> StoreLocation {
        self.location_in(&self.backup.region)
    }

    /// Location using this entry's endpoint and credentials in `region`.
    pub fn location_in(&self, region: &str) -> StoreLocation {
        let (key, secret) = if self.use_iam_profile {
            (None, None)
        } else {
            (non_empty(&self.aws_access_key_id), non_empty(&self.aws_secret_access_key))
        };
        StoreLocation::from_endpoint(
            non_empty(&self.endpoint).as_deref(),
            region,
            key,
            secret,
            self.force_path_style,
        )
    }
}

// Credentials stay out of logs.
impl std::fmt::Debug for BucketConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketConfig")
            .field("name", &self.name)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("use_iam_profile", &self.use_iam_profile)
            .field("force_path_style", &self.force_path_style)
            .field("backup", &self.backup)
            .finish_non_exhaustive()
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// A soft-delete capable container.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    pub storage_account: String,
    #[serde(default)]
    pub storage_key: String,
    /// Account holding the backed-up container when restoring elsewhere.
    #[serde(default)]
    pub restore_from: Option<RestoreFromConfig>,
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct RestoreFromConfig {
    pub storage_account: String,
    #[serde(default)]
    pub storage_key: String,
}

impl std::fmt::Debug for ContainerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerConfig")
            .field("name", &self.name)
            .field("storage_account", &self.storage_account)
            .field(
                "restore_from",
                &self.restore_from.as_ref().map(|r| r.storage_account.as_str()),
            )
            .finish_non_exhaustive()
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, T>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        BackupError::Config(format!("could not read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&contents).map_err(|e| {
        BackupError::Config(format!("config file {} has an invalid format: {}", path.display(), e))
    })
}

pub fn load_bucket_configs(path: &Path) -> Result<BTreeMap<String, BucketConfig>> {
    load_json(path)
}

pub fn load_container_configs(path: &Path) -> Result<BTreeMap<String, ContainerConfig>> {
    load_json(path)
}

/// Process-wide tunables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub log_level: String,
    pub max_in_flight: usize,
    pub list_retry_attempts: usize,
    pub list_retry_backoff_ms: u64,
    pub copy_poll_interval_ms: u64,
    pub restore_signed_url_ttl_secs: u64,
    #[serde(default)]
    pub executor_deadline_secs: Option<u64>,
}

impl Settings {
    /// Defaults overridden by the process environment.
    pub fn load() -> Result<Self> {
        Self::from_env(None)
    }

    /// Like [`Settings::load`], reading variables from `vars` instead of the
    /// process environment when given.
    pub fn from_env(vars: Option<config::Map<String, String>>) -> Result<Self> {
        let invalid = |e: config::ConfigError| BackupError::Config(format!("invalid settings: {}", e));

        let settings: Settings = config::Config::builder()
            .set_default("log_level", "info")
            .and_then(|b| b.set_default("max_in_flight", DEFAULT_MAX_IN_FLIGHT as i64))
            .and_then(|b| b.set_default("list_retry_attempts", 3_i64))
            .and_then(|b| b.set_default("list_retry_backoff_ms", 5_000_i64))
            .and_then(|b| b.set_default("copy_poll_interval_ms", DEFAULT_POLL_INTERVAL.as_millis() as i64))
            .and_then(|b| b.set_default("restore_signed_url_ttl_secs", DEFAULT_SIGNED_URL_TTL.as_secs() as i64))
            .map_err(invalid)?
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(vars),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(invalid)?;

        if settings.max_in_flight == 0 {
            return Err(BackupError::Config("max_in_flight must be at least 1".to_string()));
        }
        if settings.list_retry_attempts == 0 {
            return Err(BackupError::Config("list_retry_attempts must be at least 1".to_string()));
        }
        Ok(settings)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.list_retry_attempts,
            Duration::from_millis(self.list_retry_backoff_ms),
        )
    }

    pub fn executor(&self) -> ParallelExecutor {
        ParallelExecutor::new(self.max_in_flight)
            .with_deadline(self.executor_deadline_secs.map(Duration::from_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.copy_poll_interval_ms)
    }

    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.restore_signed_url_ttl_secs)
    }
}
