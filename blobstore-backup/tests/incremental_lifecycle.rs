//! Start, complete and restore incremental backups over in-memory object stores.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use blobstore_backup::artifact::{Artifact, FileArtifact};
use blobstore_backup::builder;
use blobstore_backup::config::{BackupBucketConfig, BucketConfig};
use blobstore_backup::executor::ParallelExecutor;
use blobstore_backup::incremental::{BackupCompleter, BackupStarter, BucketBackup, Clock, Restorer};
use blobstore_backup::retry::RetryPolicy;
use blobstore_backup::storage::{Bucket, ObjectStoreBucket, StoreLocation};
use blobstore_backup::Result;
use object_store::memory::InMemory;
use tempfile::TempDir;

struct FixedClock(&'static str);

impl Clock for FixedClock {
    fn now(&self) -> String {
        self.0.to_string()
    }
}

struct World {
    buckets: HashMap<String, Arc<ObjectStoreBucket>>,
    configs: BTreeMap<String, BucketConfig>,
    dir: TempDir,
}

impl World {
    fn new(ids: &[(&str, &str)]) -> Self {
        let mut buckets = HashMap::new();
        let mut configs = BTreeMap::new();
        for (id, live) in ids {
            for name in [live.to_string(), "backup".to_string()] {
                buckets.entry(name.clone()).or_insert_with(|| {
                    Arc::new(
                        ObjectStoreBucket::new(name, "eu-west-1", Arc::new(InMemory::new()))
                            .with_retry(RetryPolicy::immediate(3)),
                    )
                });
            }
            configs.insert(
                id.to_string(),
                BucketConfig {
                    name: live.to_string(),
                    region: "eu-west-1".into(),
                    aws_access_key_id: String::new(),
                    aws_secret_access_key: String::new(),
                    endpoint: String::new(),
                    use_iam_profile: true,
                    force_path_style: false,
                    backup: BackupBucketConfig {
                        name: "backup".into(),
                        region: "eu-west-1".into(),
                    },
                },
            );
        }

        Self {
            buckets,
            configs,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn bucket(&self, name: &str) -> Arc<ObjectStoreBucket> {
        self.buckets[name].clone()
    }

    fn open(&self, name: &str, _location: &StoreLocation) -> Result<Arc<dyn Bucket>> {
        let bucket: Arc<dyn Bucket> = self.bucket(name);
        Ok(bucket)
    }

    fn artifact(&self) -> Arc<FileArtifact<BucketBackup>> {
        Arc::new(FileArtifact::new(self.dir.path().join("backup.json")))
    }

    fn existing_artifact(&self) -> Arc<FileArtifact<BucketBackup>> {
        Arc::new(FileArtifact::new(self.dir.path().join("existing.json")))
    }

    async fn start(&self, timestamp: &'static str) {
        let to_start = builder::build_backups_to_start(&self.configs, &|n, l| self.open(n, l))
            .await
            .unwrap();
        BackupStarter::new(
            to_start,
            Arc::new(FixedClock(timestamp)),
            self.artifact(),
            self.existing_artifact(),
        )
        .with_executor(ParallelExecutor::new(4))
        .run()
        .await
        .unwrap();
    }

    async fn complete(&self) {
        let to_complete =
            builder::build_backups_to_complete(&self.configs, self.existing_artifact().as_ref(), &|n, l| {
                self.open(n, l)
            })
            .await
            .unwrap();
        BackupCompleter::new(to_complete).run().await.unwrap();
    }

    async fn restore(&self) -> Result<()> {
        let artifact = self.artifact();
        let pairs = builder::build_restore_bucket_pairs(&self.configs, artifact.as_ref(), &|n, l| self.open(n, l))
            .await?;
        Restorer::new(pairs, artifact).run().await
    }
}

async fn put(bucket: &ObjectStoreBucket, path: &str, contents: &str) {
    bucket.upload_blob(path, contents).await.unwrap();
}

async fn read(bucket: &ObjectStoreBucket, path: &str) -> String {
    String::from_utf8(bucket.read_blob(path).await.unwrap().to_vec()).unwrap()
}

async fn paths(bucket: &ObjectStoreBucket, prefix: &str) -> Vec<String> {
    let mut paths: Vec<String> = bucket
        .list_blobs(prefix)
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.path)
        .collect();
    paths.sort();
    paths
}

#[tokio::test]
async fn test_backup_builds_on_previous_complete_backup_and_restores() {
    let world = World::new(&[("droplets", "live")]);
    let live = world.bucket("live");
    let backup = world.bucket("backup");
    put(&live, "a", "original a").await;
    put(&live, "f0/b", "original b").await;

    world.start("2024_01_01_00_00_00").await;
    world.complete().await;

    assert_eq!(
        paths(&backup, "2024_01_01_00_00_00/droplets").await,
        vec![
            "2024_01_01_00_00_00/droplets/a",
            "2024_01_01_00_00_00/droplets/backup_complete",
            "2024_01_01_00_00_00/droplets/f0/b",
        ]
    );

    put(&live, "c", "added later").await;
    world.start("2024_02_01_00_00_00").await;

    // Only the new blob is copied while the backup is being started.
    assert_eq!(
        paths(&backup, "2024_02_01_00_00_00/droplets").await,
        vec!["2024_02_01_00_00_00/droplets/c"]
    );
    let existing = world.existing_artifact().load().unwrap();
    assert_eq!(
        existing["droplets"].blobs,
        vec!["2024_01_01_00_00_00/droplets/a", "2024_01_01_00_00_00/droplets/f0/b"]
    );
    assert_eq!(existing["droplets"].dst_backup_directory_path, "2024_02_01_00_00_00/droplets");

    world.complete().await;

    let recorded = world.artifact().load().unwrap();
    assert_eq!(recorded["droplets"].bucket_name, "backup");
    assert_eq!(recorded["droplets"].blobs.len(), 3);
    assert_eq!(read(&backup, "2024_02_01_00_00_00/droplets/a").await, "original a");

    put(&live, "a", "corrupted").await;
    world.restore().await.unwrap();

    assert_eq!(read(&live, "a").await, "original a");
    assert_eq!(read(&live, "f0/b").await, "original b");
    assert_eq!(read(&live, "c").await, "added later");
}

#[tokio::test]
async fn test_incomplete_backup_is_not_a_baseline() {
    let world = World::new(&[("droplets", "live")]);
    let live = world.bucket("live");
    put(&live, "a", "1").await;

    world.start("2024_01_01_00_00_00").await;
    world.start("2024_02_01_00_00_00").await;

    assert_eq!(
        paths(&world.bucket("backup"), "2024_02_01_00_00_00/droplets").await,
        vec!["2024_02_01_00_00_00/droplets/a"]
    );
    let existing = world.existing_artifact().load().unwrap();
    assert!(existing["droplets"].blobs.is_empty());
}

#[tokio::test]
async fn test_shared_live_bucket_is_backed_up_and_restored_once() {
    let world = World::new(&[("droplets", "live"), ("packages", "live")]);
    let live = world.bucket("live");
    put(&live, "a", "1").await;

    world.start("2024_01_01_00_00_00").await;
    world.complete().await;

    let recorded = world.artifact().load().unwrap();
    assert_eq!(recorded["packages"], BucketBackup::same_as("droplets"));
    assert!(paths(&world.bucket("backup"), "2024_01_01_00_00_00/packages")
        .await
        .is_empty());

    world.restore().await.unwrap();
    assert_eq!(read(&live, "a").await, "1");
}

#[tokio::test]
async fn test_restore_fails_when_backup_directory_lost_blobs() {
    let world = World::new(&[("droplets", "live")]);
    put(&world.bucket("live"), "a", "1").await;
    world.start("2024_01_01_00_00_00").await;
    world.complete().await;

    let mut recorded = world.artifact().load().unwrap();
    if let Some(entry) = recorded.get_mut("droplets") {
        entry.blobs.push("2024_01_01_00_00_00/droplets/ghost".into());
    }
    world.artifact().write(&recorded).unwrap();

    let err = world.restore().await.unwrap_err();

    assert_eq!(
        err.to_string(),
        "found blobs in artifact that are not present in backup directory for bucket backup: \
         2024_01_01_00_00_00/droplets/ghost"
    );
}
