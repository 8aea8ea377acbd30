//! Blobstore Backup - Main entry point
//!
//! Runs one phase of an incremental bucket backup, or a restore.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use blobstore_backup::artifact::FileArtifact;
use blobstore_backup::incremental::{BackupCompleter, BackupStarter, BucketBackup, Restorer, SystemClock};
use blobstore_backup::storage::{Bucket, ObjectStoreBucket, StoreLocation};
use blobstore_backup::{builder, config, utils, Settings};
use clap::{ArgGroup, Parser};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("mode").required(true).args(["backup", "complete_backup", "restore"])))]
struct Args {
    /// Path to the bucket configuration (JSON)
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Backup artifact, written by --backup and read by --restore
    #[arg(long, value_name = "FILE")]
    artifact_file: Option<PathBuf>,

    /// Reusable blobs recorded by --backup for --complete-backup
    #[arg(long, value_name = "FILE")]
    existing_artifact_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Start a backup: copy new blobs and write both artifacts
    #[arg(long, requires = "artifact_file", requires = "existing_artifact_file")]
    backup: bool,

    /// Copy reusable blobs forward and mark the backups complete
    #[arg(long, requires = "existing_artifact_file")]
    complete_backup: bool,

    /// Restore the live buckets from the backup artifact
    #[arg(long, requires = "artifact_file")]
    restore: bool,
}

fn required(path: Option<PathBuf>, flag: &str) -> Result<PathBuf> {
    path.with_context(|| format!("{} is required", flag))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = Settings::load().context("Failed to load settings")?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&settings.log_level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting blobstore-backup-restore v{}", env!("CARGO_PKG_VERSION"));

    let configs = config::load_bucket_configs(&args.config).context("Failed to load bucket config")?;

    let retry = settings.retry_policy();
    let open_bucket = move |name: &str, location: &StoreLocation| -> blobstore_backup::Result<Arc<dyn Bucket>> {
        let bucket: Arc<dyn Bucket> = Arc::new(ObjectStoreBucket::open(name, location, retry)?);
        Ok(bucket)
    };

    if args.backup {
        let artifact = required(args.artifact_file, "--artifact-file")?;
        let existing = required(args.existing_artifact_file, "--existing-artifact-file")?;

        let backups_to_start = builder::build_backups_to_start(&configs, &open_bucket)
            .await
            .context("Failed to prepare backup")?;
        BackupStarter::new(
            backups_to_start,
            Arc::new(SystemClock),
            Arc::new(FileArtifact::<BucketBackup>::new(artifact)),
            Arc::new(FileArtifact::<BucketBackup>::new(existing)),
        )
        .with_executor(settings.executor())
        .run()
        .await
        .context("Backup failed")?;
    } else if args.complete_backup {
        let existing = required(args.existing_artifact_file, "--existing-artifact-file")?;

        let backups_to_complete =
            builder::build_backups_to_complete(&configs, &FileArtifact::<BucketBackup>::new(existing), &open_bucket)
                .await
                .context("Failed to prepare backup completion")?;
        BackupCompleter::new(backups_to_complete)
            .with_executor(settings.executor())
            .run()
            .await
            .context("Backup completion failed")?;
    } else {
        let artifact = required(args.artifact_file, "--artifact-file")?;
        let artifact = Arc::new(FileArtifact::<BucketBackup>::new(artifact));

        let pairs = builder::build_restore_bucket_pairs(&configs, artifact.as_ref(), &open_bucket)
            .await
            .context("Failed to prepare restore")?;
        Restorer::new(pairs, artifact)
            .with_executor(settings.executor())
            .run()
            .await
            .context("Restore failed")?;
    }

    tracing::info!("Done");
    Ok(())
}
