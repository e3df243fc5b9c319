//! Reference → manifest index.
//!
//! One JSON record per reference under `index/`, named by the sha256 of the
//! rendered reference. The record files are the only state: every lookup
//! reads them, so handles and processes sharing a root agree on the last
//! rename to land.

use std::io::Write;
use std::path::{Path, PathBuf};

use chartstash_core::error::{Result, StashError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::manifest::Descriptor;

const RECORD_EXTENSION: &str = "json";

/// A persisted index record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Rendered reference this record is keyed by
    pub reference: String,
    /// Descriptor of the manifest blob
    pub manifest: Descriptor,
    /// When the record was last written
    pub updated: DateTime<Utc>,
}

pub struct ReferenceIndex {
    dir: PathBuf,
    tmp_dir: PathBuf,
}

impl ReferenceIndex {
    pub fn open(dir: PathBuf, tmp_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir).map_err(|e| {
            StashError::io(format!("Failed to create index directory {}", dir.display()), e)
        })?;
        Ok(Self { dir, tmp_dir })
    }

    /// Current record for `key`, read from disk.
    pub fn get(&self, key: &str) -> Option<IndexRecord> {
        let record = read_record(&self.record_path(key))?;
        (record.reference == key).then_some(record)
    }

    /// Point `key` at `manifest`, replacing any previous record.
    pub fn set(&self, key: &str, manifest: Descriptor) -> Result<IndexRecord> {
        let record = IndexRecord {
            reference: key.to_string(),
            manifest,
            updated: Utc::now(),
        };
        let data = serde_json::to_vec_pretty(&record)?;
        let path = self.record_path(key);

        let mut tmp = tempfile::Builder::new()
            .prefix(".index-")
            .tempfile_in(&self.tmp_dir)
            .map_err(|e| {
                StashError::io(
                    format!("Failed to create temp file in {}", self.tmp_dir.display()),
                    e,
                )
            })?;
        tmp.write_all(&data).map_err(|e| {
            StashError::io(format!("Failed to write index record for {}", key), e)
        })?;
        tmp.persist(&path).map_err(|e| {
            StashError::io(format!("Failed to save index record {}", path.display()), e.error)
        })?;

        Ok(record)
    }

    /// Drop the record for `key`. Returns whether one existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let path = self.record_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StashError::io(
                format!("Failed to remove index record {}", path.display()),
                e,
            )),
        }
    }

    /// Snapshot of the keys currently on disk, in order. Unreadable
    /// records are skipped with a warning.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .record_paths()?
            .iter()
            .filter_map(|path| read_record(path))
            .map(|record| record.reference)
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Number of record files on disk.
    pub fn len(&self) -> Result<usize> {
        Ok(self.record_paths()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn record_paths(&self) -> Result<Vec<PathBuf>> {
        let read_dir = std::fs::read_dir(&self.dir).map_err(|e| {
            StashError::io(format!("Failed to read index directory {}", self.dir.display()), e)
        })?;
        Ok(read_dir
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION))
            .collect())
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!(
            "{}.{}",
            hex::encode(Sha256::digest(key.as_bytes())),
            RECORD_EXTENSION
        ))
    }
}

/// Read one record. Missing files are `None`; corrupt ones are logged and
/// also `None`.
fn read_record(path: &Path) -> Option<IndexRecord> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable index record");
            return None;
        }
    };
    match serde_json::from_slice::<IndexRecord>(&data) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Skipping corrupt index record");
            None
        }
    }
}
