//! Local chart cache.
//!
//! Layout under the root:
//!
//! ```text
//! blobs/sha256/<hex>        content-addressed blobs
//! index/<sha256(ref)>.json  reference → manifest descriptor
//! tmp/                      staging for atomic writes
//! ```
//!
//! Safe to share between tasks and between processes pointing at the same
//! root: blobs and index records are only ever replaced by rename, and every
//! read goes to disk. Nothing is ever evicted.

mod blobs;
mod index;

pub use blobs::BlobStore;
pub use index::{IndexRecord, ReferenceIndex};

use std::path::{Path, PathBuf};

use chartstash_core::error::{Result, StashError};
use chrono::{DateTime, Utc};

use crate::digest::Digest;
use crate::manifest::{Descriptor, Manifest, OCI_MANIFEST_MEDIA_TYPE};
use crate::reference::Reference;

pub const BLOBS_DIR: &str = "blobs";
pub const INDEX_DIR: &str = "index";
pub const TMP_DIR: &str = "tmp";

/// An indexed reference as returned by [`Cache::list_references`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub reference: Reference,
    pub manifest: Descriptor,
    pub updated: DateTime<Utc>,
}

/// Content-addressed blob store plus reference index.
pub struct Cache {
    root: PathBuf,
    blobs: BlobStore,
    index: ReferenceIndex,
}

impl Cache {
    /// Open (creating if needed) the cache rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let tmp_dir = root.join(TMP_DIR);
        let blobs = BlobStore::open(root.join(BLOBS_DIR), tmp_dir.clone())?;
        let index = ReferenceIndex::open(root.join(INDEX_DIR), tmp_dir)?;

        tracing::debug!(
            root = %root.display(),
            references = index.len().unwrap_or_default(),
            "Opened chart cache"
        );

        Ok(Self { root, blobs, index })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `data` and describe it under `media_type`.
    pub fn put_blob(&self, data: &[u8], media_type: &str) -> Result<Descriptor> {
        let (digest, written) = self.blobs.put(data)?;
        if written {
            tracing::debug!(digest = %digest, size = data.len(), media_type, "Cached blob");
        } else {
            tracing::debug!(digest = %digest, "Blob already cached");
        }
        Ok(Descriptor {
            media_type: media_type.to_string(),
            digest,
            size: data.len() as i64,
            annotations: Default::default(),
        })
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blobs.contains(digest)
    }

    pub fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.blobs.get(digest)
    }

    /// Every blob digest on disk, sorted.
    pub fn blob_digests(&self) -> Result<Vec<Digest>> {
        self.blobs.digests()
    }

    /// Path of the blob file for `digest`.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs.path(digest)
    }

    /// Serialize and store `manifest`, then index it under `reference`.
    pub fn put_manifest(&self, reference: &Reference, manifest: &Manifest) -> Result<Descriptor> {
        let media_type = manifest
            .media_type
            .clone()
            .unwrap_or_else(|| OCI_MANIFEST_MEDIA_TYPE.to_string());
        self.put_manifest_bytes(reference, &manifest.to_vec()?, &media_type)
    }

    /// Store manifest bytes exactly as given and index them under `reference`.
    pub fn put_manifest_bytes(
        &self,
        reference: &Reference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor> {
        Manifest::from_slice(data)?;
        let descriptor = self.put_blob(data, media_type)?;
        let key = reference.to_string();
        self.index.set(&key, descriptor.clone())?;

        tracing::info!(reference = %key, digest = %descriptor.digest, "Indexed manifest");
        Ok(descriptor)
    }

    /// Manifest indexed under `reference`, with its descriptor.
    pub fn get_manifest(&self, reference: &Reference) -> Result<(Manifest, Descriptor)> {
        let key = reference.to_string();
        let record = self
            .index
            .get(&key)
            .ok_or_else(|| StashError::NotFound(format!("reference {}", key)))?;
        let data = self.blobs.get(&record.manifest.digest)?;
        let manifest = Manifest::from_slice(&data)?;
        Ok((manifest, record.manifest))
    }

    /// Lazily iterate the indexed references.
    ///
    /// Keys on disk are snapshotted now, sorted; each record is re-read as
    /// the iterator advances, so records removed in between are skipped and
    /// records replaced in between show their latest manifest.
    pub fn list_references(&self) -> References<'_> {
        let keys = self.index.keys().unwrap_or_else(|e| {
            tracing::warn!(root = %self.root.display(), error = %e, "Failed to list cache index");
            Vec::new()
        });
        References {
            index: &self.index,
            keys: keys.into_iter(),
        }
    }

    /// Drop the index record for `reference`. Blobs are kept.
    pub fn remove_reference(&self, reference: &Reference) -> Result<bool> {
        let key = reference.to_string();
        let removed = self.index.remove(&key)?;
        if removed {
            tracing::info!(reference = %key, "Removed reference from cache index");
        }
        Ok(removed)
    }
}

/// Iterator over [`IndexEntry`] values.
pub struct References<'a> {
    index: &'a ReferenceIndex,
    keys: std::vec::IntoIter<String>,
}

impl Iterator for References<'_> {
    type Item = IndexEntry;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            let Some(record) = self.index.get(&key) else {
                continue;
            };
            match Reference::parse(&record.reference) {
                Ok(reference) => {
                    return Some(IndexEntry {
                        reference,
                        manifest: record.manifest,
                        updated: record.updated,
                    })
                }
                Err(e) => {
                    tracing::warn!(reference = %record.reference, error = %e, "Skipping unparseable index key");
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.keys.len()))
    }
}
