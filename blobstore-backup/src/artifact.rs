//! Backup artifact: the JSON manifest handed from one run to the next.
//!
//! An artifact maps a logical container ID to that container's record. It is
//! written once per backup run (overwriting any previous file) and read once
//! per restore run.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::utils::{BackupError, Result};

/// Record types that can point at another record instead of carrying data.
pub trait Record {
    /// ID of the record this one duplicates, if any.
    fn same_as(&self) -> Option<&str>;

    /// Whether any of the data fields are populated.
    fn has_primary_fields(&self) -> bool;
}

pub trait Artifact<T>: Send + Sync {
    fn write(&self, records: &BTreeMap<String, T>) -> Result<()>;

    fn load(&self) -> Result<BTreeMap<String, T>>;
}

/// Artifact stored as a pretty-printed JSON object on disk.
#[derive(Debug, Clone)]
pub struct FileArtifact<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> FileArtifact<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T> Artifact<T> for FileArtifact<T>
where
    T: Record + Serialize + DeserializeOwned,
{
    fn write(&self, records: &BTreeMap<String, T>) -> Result<()> {
        let json = serde_json::to_string_pretty(records)
            .map_err(|e| BackupError::Artifact(format!("could not write backup file: {}", e)))?;
        std::fs::write(&self.path, json)
            .map_err(|e| BackupError::Artifact(format!("could not write backup file: {}", e)))?;
        debug!("Wrote {} records to {}", records.len(), self.path.display());
        Ok(())
    }

    fn load(&self) -> Result<BTreeMap<String, T>> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| BackupError::Artifact(format!("could not read backup file: {}", e)))?;
        let records: BTreeMap<String, T> = serde_json::from_str(&contents)
            .map_err(|e| BackupError::Artifact(format!("backup file has an invalid format: {}", e)))?;
        validate_references(&records)?;
        Ok(records)
    }
}

/// Checks `same_as` links: the target exists, the referencing record carries
/// no data of its own, and the target is not itself a reference.
pub fn validate_references<T: Record>(records: &BTreeMap<String, T>) -> Result<()> {
    for (id, record) in records {
        let Some(target) = record.same_as() else {
            continue;
        };

        if record.has_primary_fields() {
            return Err(BackupError::Artifact(format!(
                "record '{}' references '{}' but also has its own data",
                id, target
            )));
        }

        match records.get(target) {
            None => {
                return Err(BackupError::Artifact(format!(
                    "record '{}' references unknown record '{}'",
                    id, target
                )))
            }
            Some(t) if t.same_as().is_some() => {
                return Err(BackupError::Artifact(format!(
                    "record '{}' references '{}', which is itself a reference",
                    id, target
                )))
            }
            Some(_) => {}
        }
    }

    Ok(())
}
