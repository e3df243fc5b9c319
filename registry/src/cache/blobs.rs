//! Content-addressed blob files.
//!
//! Each blob lives at `blobs/<algorithm>/<hex>`, so a file's name is always
//! the digest of its contents. Writes go to a temporary file under `tmp/`
//! and are renamed into place; readers never observe a partial blob.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chartstash_core::error::{Result, StashError};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::digest::{Algorithm, Digest};

/// Content-addressed blob store.
pub struct BlobStore {
    /// `<root>/blobs`
    blobs_dir: PathBuf,
    /// `<root>/tmp`, on the same volume so renames are atomic
    tmp_dir: PathBuf,
    /// Per-digest write locks; entries are dropped once unused
    locks: DashMap<Digest, Arc<Mutex<()>>>,
}

impl BlobStore {
    pub fn open(blobs_dir: PathBuf, tmp_dir: PathBuf) -> Result<Self> {
        let algo_dir = blobs_dir.join(Algorithm::Sha256.as_str());
        for dir in [&algo_dir, &tmp_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                StashError::io(format!("Failed to create cache directory {}", dir.display()), e)
            })?;
        }

        Ok(Self {
            blobs_dir,
            tmp_dir,
            locks: DashMap::new(),
        })
    }

    /// Path of the file holding `digest`.
    pub fn path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.path(digest).is_file()
    }

    /// Store `data` under its digest.
    ///
    /// Returns the digest and whether this call wrote the file (`false` on a
    /// hit). Concurrent writers of the same digest serialize on that digest
    /// only, so at most one of them writes.
    pub fn put(&self, data: &[u8]) -> Result<(Digest, bool)> {
        let digest = Digest::from_bytes(data);
        let dest = self.path(&digest);
        if dest.is_file() {
            return Ok((digest, false));
        }

        let lock = self
            .locks
            .entry(digest.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock();
            if dest.is_file() {
                Ok(false)
            } else {
                self.write_atomic(&dest, data).map(|_| true)
            }
        };

        drop(lock);
        self.locks
            .remove_if(&digest, |_, lock| Arc::strong_count(lock) == 1);

        result.map(|written| (digest, written))
    }

    /// Read a blob. Contents are trusted to match the digest.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.path(digest);
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StashError::NotFound(format!("blob {}", digest))
            } else {
                StashError::io(format!("Failed to read blob {}", path.display()), e)
            }
        })
    }

    /// Every digest currently on disk.
    pub fn digests(&self) -> Result<Vec<Digest>> {
        let algo_dir = self.blobs_dir.join(Algorithm::Sha256.as_str());
        let read_dir = std::fs::read_dir(&algo_dir).map_err(|e| {
            StashError::io(format!("Failed to read blob directory {}", algo_dir.display()), e)
        })?;

        let mut digests = Vec::new();
        for entry in read_dir.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(digest) = Digest::parse(&format!("{}:{}", Algorithm::Sha256, name)) {
                    digests.push(digest);
                }
            }
        }
        digests.sort();
        Ok(digests)
    }

    fn write_atomic(&self, dest: &Path, data: &[u8]) -> Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".blob-")
            .tempfile_in(&self.tmp_dir)
            .map_err(|e| {
                StashError::io(
                    format!("Failed to create temp file in {}", self.tmp_dir.display()),
                    e,
                )
            })?;

        tmp.write_all(data).map_err(|e| {
            StashError::io(format!("Failed to write temp blob {}", tmp.path().display()), e)
        })?;

        tmp.persist(dest).map_err(|e| {
            StashError::io(format!("Failed to move blob into place at {}", dest.display()), e.error)
        })?;

        tracing::debug!(path = %dest.display(), size = data.len(), "Wrote blob");
        Ok(())
    }
}
