use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{error, info};

use super::{BackedUpBlob, BackupDirectoryFinder, BucketBackup, Clock};
use crate::artifact::Artifact;
use crate::blobpath;
use crate::executor::{operation, ParallelExecutor};
use crate::storage::{Blob, Bucket};
use crate::utils::{BackupError, Result};

/// Live blobs split against the previous complete backup.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BlobDiff {
    /// New or changed since the baseline; copied during the start phase.
    pub to_copy: Vec<Blob>,
    /// Baseline blobs still matching live content; copied forward by the completer.
    pub reusable: Vec<BackedUpBlob>,
}

/// Matches live blobs to baseline blobs by live-relative path.
///
/// A matched blob is only reused if its version token agrees with the
/// baseline's. Backends that cannot report a stable token give `None`,
/// in which case the path alone decides.
pub fn diff_live_blobs(backed_up: &[BackedUpBlob], live: &[Blob]) -> Result<BlobDiff> {
    let mut baseline: HashMap<&str, &BackedUpBlob> = HashMap::with_capacity(backed_up.len());
    for blob in backed_up {
        baseline.insert(blob.live_blob_path()?, blob);
    }

    let mut diff = BlobDiff::default();
    for blob in live {
        match baseline.get(blob.path.as_str()) {
            Some(previous) if same_content(&previous.version, &blob.version) => {
                diff.reusable.push((*previous).clone())
            }
            _ => diff.to_copy.push(blob.clone()),
        }
    }

    Ok(diff)
}

fn same_content(previous: &Option<String>, current: &Option<String>) -> bool {
    match (previous, current) {
        (Some(previous), Some(current)) => previous == current,
        _ => true,
    }
}

#[derive(Debug, Clone)]
pub struct BackupBucketPair {
    pub live_bucket: Arc<dyn Bucket>,
    pub backup_bucket: Arc<dyn Bucket>,
}

impl BackupBucketPair {
    pub fn new(live_bucket: Arc<dyn Bucket>, backup_bucket: Arc<dyn Bucket>) -> Self {
        Self {
            live_bucket,
            backup_bucket,
        }
    }

    /// Copies live blobs missing from `backed_up` into `backup_directory_path`
    /// and returns the baseline blobs that can be reused instead.
    pub async fn copy_new_live_blobs_to_backup(
        &self,
        executor: &ParallelExecutor,
        backed_up: &[BackedUpBlob],
        live_blobs: &[Blob],
        backup_directory_path: &str,
    ) -> Result<Vec<BackedUpBlob>> {
        let diff = diff_live_blobs(backed_up, live_blobs)?;

        info!(
            "Bucket {}: {} blobs to copy, {} reusable",
            self.live_bucket.name(),
            diff.to_copy.len(),
            diff.reusable.len()
        );

        let copies = diff
            .to_copy
            .iter()
            .map(|blob| {
                let live = Arc::clone(&self.live_bucket);
                let backup = Arc::clone(&self.backup_bucket);
                let src = blob.path.clone();
                let dst = blobpath::join(backup_directory_path, &blob.path);
                operation(async move { backup.copy_blob_from_bucket(live.as_ref(), &src, &dst).await })
            })
            .collect();

        let errors = executor.run_batch(copies).await;
        if !errors.is_empty() {
            return Err(BackupError::aggregate("failed to copy blobs during backup", errors));
        }

        Ok(diff.reusable)
    }
}

/// One configured bucket as seen by the start phase.
#[derive(Debug)]
pub enum BackupToStart {
    Pending {
        bucket_pair: BackupBucketPair,
        finder: Arc<dyn BackupDirectoryFinder>,
    },
    /// Same live bucket as another ID, which does the actual work.
    SameAs(String),
}

/// Keeps one backup per live bucket.
///
/// IDs sharing a live bucket name are grouped; the lexicographically first
/// one stays pending and the others point at it.
pub fn mark_same_backups_to_start(
    backups_to_start: BTreeMap<String, BackupToStart>,
) -> BTreeMap<String, BackupToStart> {
    let mut first_id_by_live_bucket: HashMap<String, String> = HashMap::new();
    let mut marked = BTreeMap::new();

    // BTreeMap iterates in key order, so the first ID seen per bucket is the smallest.
    for (id, to_start) in backups_to_start {
        let BackupToStart::Pending { bucket_pair, .. } = &to_start else {
            marked.insert(id, to_start);
            continue;
        };

        let live_name = bucket_pair.live_bucket.name().to_string();
        match first_id_by_live_bucket.get(&live_name) {
            Some(first) => {
                marked.insert(id, BackupToStart::SameAs(first.clone()));
            }
            None => {
                first_id_by_live_bucket.insert(live_name, id.clone());
                marked.insert(id, to_start);
            }
        }
    }

    marked
}

/// Start phase of an incremental backup.
pub struct BackupStarter {
    backups_to_start: BTreeMap<String, BackupToStart>,
    clock: Arc<dyn Clock>,
    backup_artifact: Arc<dyn Artifact<BucketBackup>>,
    existing_blobs_artifact: Arc<dyn Artifact<BucketBackup>>,
    executor: ParallelExecutor,
}

impl BackupStarter {
    pub fn new(
        backups_to_start: BTreeMap<String, BackupToStart>,
        clock: Arc<dyn Clock>,
        backup_artifact: Arc<dyn Artifact<BucketBackup>>,
        existing_blobs_artifact: Arc<dyn Artifact<BucketBackup>>,
    ) -> Self {
        Self {
            backups_to_start,
            clock,
            backup_artifact,
            existing_blobs_artifact,
            executor: ParallelExecutor::default(),
        }
    }

    pub fn with_executor(mut self, executor: ParallelExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Copies new blobs for every bucket, then writes both artifacts.
    ///
    /// Every bucket is attempted. If any fails, neither artifact is written
    /// and the first error is returned.
    pub async fn run(&self) -> Result<()> {
        let timestamp = self.clock.now();
        info!("Starting backup {}", timestamp);

        let mut backups = BTreeMap::new();
        let mut existing_blobs = BTreeMap::new();
        let mut first_error = None;

        for (id, to_start) in &self.backups_to_start {
            match to_start {
                BackupToStart::SameAs(other) => {
                    info!("Bucket {} is the same as {}, skipping", id, other);
                    backups.insert(id.clone(), BucketBackup::same_as(other));
                    existing_blobs.insert(id.clone(), BucketBackup::same_as(other));
                }
                BackupToStart::Pending { bucket_pair, finder } => {
                    match self.start_bucket(id, &timestamp, bucket_pair, finder.as_ref()).await {
                        Ok((backup, existing)) => {
                            backups.insert(id.clone(), backup);
                            existing_blobs.insert(id.clone(), existing);
                        }
                        Err(e) => {
                            error!("Backup of bucket {} failed: {}", id, e);
                            first_error.get_or_insert(e);
                        }
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        self.backup_artifact
            .write(&backups)
            .map_err(|e| e.context("failed to write backup artifact"))?;
        self.existing_blobs_artifact
            .write(&existing_blobs)
            .map_err(|e| e.context("failed to write existing blobs artifact"))?;

        Ok(())
    }

    async fn start_bucket(
        &self,
        id: &str,
        timestamp: &str,
        bucket_pair: &BackupBucketPair,
        finder: &dyn BackupDirectoryFinder,
    ) -> Result<(BucketBackup, BucketBackup)> {
        let backup_directory_path = blobpath::join(timestamp, id);

        let backed_up = finder
            .list_blobs(id)
            .await
            .map_err(|e| e.context("failed to start backup"))?;
        let live_blobs = bucket_pair
            .live_bucket
            .list_blobs("")
            .await
            .map_err(|e| e.context("failed to start backup"))?;

        let reusable = bucket_pair
            .copy_new_live_blobs_to_backup(&self.executor, &backed_up, &live_blobs, &backup_directory_path)
            .await?;

        let backup = BucketBackup {
            bucket_name: bucket_pair.backup_bucket.name().to_string(),
            bucket_region: bucket_pair.backup_bucket.region().to_string(),
            blobs: live_blobs
                .iter()
                .map(|blob| blobpath::join(&backup_directory_path, &blob.path))
                .collect(),
            src_backup_directory_path: backup_directory_path.clone(),
            ..BucketBackup::default()
        };

        let existing = BucketBackup {
            src_backup_directory_path: backed_up
                .first()
                .map(|blob| blob.backup_directory_path.clone())
                .unwrap_or_default(),
            dst_backup_directory_path: backup_directory_path,
            blobs: reusable.into_iter().map(|blob| blob.path).collect(),
            ..BucketBackup::default()
        };

        Ok((backup, existing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incremental::LastBackupDirectoryFinder;
    use crate::testutil::{FakeArtifact, FakeBucket, FakeClock};

    const NOW: &str = "2024_06_01_12_00_00";
    const BASELINE: &str = "2024_05_01_12_00_00";

    fn pending(live: &Arc<FakeBucket>, backup: &Arc<FakeBucket>) -> BackupToStart {
        BackupToStart::Pending {
            bucket_pair: BackupBucketPair::new(live.clone(), backup.clone()),
            finder: Arc::new(LastBackupDirectoryFinder::new(backup.clone())),
        }
    }

    struct Harness {
        backup_artifact: Arc<FakeArtifact<BucketBackup>>,
        existing_artifact: Arc<FakeArtifact<BucketBackup>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                backup_artifact: FakeArtifact::new(),
                existing_artifact: FakeArtifact::new(),
            }
        }

        fn starter(&self, backups: BTreeMap<String, BackupToStart>) -> BackupStarter {
            BackupStarter::new(
                backups,
                Arc::new(FakeClock(NOW)),
                self.backup_artifact.clone(),
                self.existing_artifact.clone(),
            )
        }
    }

    #[test]
    fn test_diff_copies_new_and_changed_and_reuses_unchanged() {
        let dir = format!("{}/droplets", BASELINE);
        let mut a = BackedUpBlob::new(format!("{}/A", dir), dir.clone());
        a.version = Some("v1".into());
        let mut b = BackedUpBlob::new(format!("{}/B", dir), dir.clone());
        b.version = Some("v1".into());

        let live = vec![
            Blob::with_version("A", "v1"),
            Blob::with_version("B", "v2"),
            Blob::with_version("C", "v1"),
        ];

        let diff = diff_live_blobs(&[a.clone(), b], &live).unwrap();

        assert_eq!(diff.to_copy, vec![Blob::with_version("B", "v2"), Blob::with_version("C", "v1")]);
        assert_eq!(diff.reusable, vec![a]);
    }

    #[test]
    fn test_diff_without_versions_matches_by_path() {
        let backed_up = vec![BackedUpBlob::new("ts/droplets/a", "ts/droplets")];
        let live = vec![Blob::new("a"), Blob::new("b")];

        let diff = diff_live_blobs(&backed_up, &live).unwrap();

        assert_eq!(diff.to_copy, vec![Blob::new("b")]);
        assert_eq!(diff.reusable, backed_up);
    }

    #[test]
    fn test_diff_rejects_corrupted_baseline() {
        let backed_up = vec![BackedUpBlob::new("elsewhere/a", "ts/droplets")];
        assert!(diff_live_blobs(&backed_up, &[Blob::new("a")]).is_err());
    }

    #[tokio::test]
    async fn test_copies_only_new_blobs_and_writes_both_artifacts() {
        let live = FakeBucket::new("live-droplets");
        live.put("a", None);
        live.put("f0/b", None);
        live.put("c", None);

        let backup = FakeBucket::in_region("backup-droplets", "eu-west-1");
        backup.put(&format!("{}/droplets/a", BASELINE), None);
        backup.put(&format!("{}/droplets/f0/b", BASELINE), None);
        backup.put(&format!("{}/droplets/backup_complete", BASELINE), None);

        let harness = Harness::new();
        let mut backups = BTreeMap::new();
        backups.insert("droplets".to_string(), pending(&live, &backup));

        harness.starter(backups).run().await.unwrap();

        assert_eq!(
            backup.copies_from(),
            vec![(
                "live-droplets".to_string(),
                "c".to_string(),
                format!("{}/droplets/c", NOW)
            )]
        );
        assert!(backup.copies_within().is_empty());

        let written = harness.backup_artifact.written().unwrap();
        assert_eq!(
            written["droplets"],
            BucketBackup {
                bucket_name: "backup-droplets".into(),
                bucket_region: "eu-west-1".into(),
                blobs: vec![
                    format!("{}/droplets/a", NOW),
                    format!("{}/droplets/c", NOW),
                    format!("{}/droplets/f0/b", NOW),
                ],
                src_backup_directory_path: format!("{}/droplets", NOW),
                ..BucketBackup::default()
            }
        );

        let existing = harness.existing_artifact.written().unwrap();
        assert_eq!(
            existing["droplets"],
            BucketBackup {
                blobs: vec![
                    format!("{}/droplets/a", BASELINE),
                    format!("{}/droplets/f0/b", BASELINE),
                ],
                src_backup_directory_path: format!("{}/droplets", BASELINE),
                dst_backup_directory_path: format!("{}/droplets", NOW),
                ..BucketBackup::default()
            }
        );
    }

    #[tokio::test]
    async fn test_first_backup_copies_everything() {
        let live = FakeBucket::new("live");
        live.put("a", None);
        live.put("b", None);
        let backup = FakeBucket::new("backup");

        let harness = Harness::new();
        let mut backups = BTreeMap::new();
        backups.insert("droplets".to_string(), pending(&live, &backup));

        harness.starter(backups).run().await.unwrap();

        assert_eq!(backup.copies_from().len(), 2);
        let existing = harness.existing_artifact.written().unwrap();
        assert!(existing["droplets"].blobs.is_empty());
        assert_eq!(existing["droplets"].dst_backup_directory_path, format!("{}/droplets", NOW));
    }

    #[tokio::test]
    async fn test_same_live_bucket_is_backed_up_once() {
        let live = FakeBucket::new("shared-live");
        live.put("a", None);
        let backup = FakeBucket::new("backup");

        let mut backups = BTreeMap::new();
        backups.insert("packages".to_string(), pending(&live, &backup));
        backups.insert("droplets".to_string(), pending(&live, &backup));
        let backups = mark_same_backups_to_start(backups);

        assert!(matches!(backups["droplets"], BackupToStart::Pending { .. }));
        assert!(matches!(&backups["packages"], BackupToStart::SameAs(id) if id == "droplets"));

        let harness = Harness::new();
        harness.starter(backups).run().await.unwrap();

        assert_eq!(live.list_blobs_calls().len(), 1);
        assert_eq!(backup.copies_from().len(), 1);

        let written = harness.backup_artifact.written().unwrap();
        assert_eq!(written["packages"], BucketBackup::same_as("droplets"));
        assert!(written["droplets"].same_bucket_as.is_none());
        let existing = harness.existing_artifact.written().unwrap();
        assert_eq!(existing["packages"], BucketBackup::same_as("droplets"));
    }

    #[tokio::test]
    async fn test_copy_failure_writes_no_artifacts_but_tries_every_bucket() {
        let droplets_live = FakeBucket::new("droplets-live");
        droplets_live.put("a", None);
        let droplets_backup = FakeBucket::new("droplets-backup");
        droplets_backup.fail_all_copies("copy refused");

        let packages_live = FakeBucket::new("packages-live");
        packages_live.put("p", None);
        let packages_backup = FakeBucket::new("packages-backup");

        let harness = Harness::new();
        let mut backups = BTreeMap::new();
        backups.insert("droplets".to_string(), pending(&droplets_live, &droplets_backup));
        backups.insert("packages".to_string(), pending(&packages_live, &packages_backup));

        let err = harness.starter(backups).run().await.unwrap_err();

        assert_eq!(err.to_string(), "failed to copy blobs during backup: copy refused");
        assert_eq!(packages_backup.copies_from().len(), 1);
        assert_eq!(harness.backup_artifact.write_count(), 0);
        assert_eq!(harness.existing_artifact.write_count(), 0);
    }

    #[tokio::test]
    async fn test_finder_failure_fails_to_start() {
        let live = FakeBucket::new("live");
        let backup = FakeBucket::new("backup");
        backup.fail_list_directories("no access");

        let harness = Harness::new();
        let mut backups = BTreeMap::new();
        backups.insert("droplets".to_string(), pending(&live, &backup));

        let err = harness.starter(backups).run().await.unwrap_err();

        assert_eq!(err.to_string(), "failed to start backup: no access");
        assert_eq!(harness.backup_artifact.write_count(), 0);
    }

    #[tokio::test]
    async fn test_live_listing_failure_fails_to_start() {
        let live = FakeBucket::new("live");
        live.fail_list_blobs("Oh no!");
        let backup = FakeBucket::new("backup");

        let harness = Harness::new();
        let mut backups = BTreeMap::new();
        backups.insert("droplets".to_string(), pending(&live, &backup));

        let err = harness.starter(backups).run().await.unwrap_err();

        assert_eq!(err.to_string(), "failed to start backup: Oh no!");
    }

    #[tokio::test]
    async fn test_artifact_write_failures() {
        let live = FakeBucket::new("live");
        let backup = FakeBucket::new("backup");

        let harness = Harness::new();
        harness.backup_artifact.fail_writes("disk full");
        let mut backups = BTreeMap::new();
        backups.insert("droplets".to_string(), pending(&live, &backup));
        let err = harness.starter(backups).run().await.unwrap_err();
        assert_eq!(err.to_string(), "failed to write backup artifact: disk full");
        assert_eq!(harness.existing_artifact.write_count(), 0);

        let harness = Harness::new();
        harness.existing_artifact.fail_writes("disk full");
        let mut backups = BTreeMap::new();
        backups.insert("droplets".to_string(), pending(&live, &backup));
        let err = harness.starter(backups).run().await.unwrap_err();
        assert_eq!(err.to_string(), "failed to write existing blobs artifact: disk full");
    }
}
