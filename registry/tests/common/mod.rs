//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chartstash_core::{RegistryErrorKind, Result, StashError};
use chartstash_registry::manifest::OCI_MANIFEST_MEDIA_TYPE;
use chartstash_registry::{Chart, Descriptor, Digest, Manifest, Metadata, Reference, Resolver};
use parking_lot::Mutex;

/// A registry held in memory.
#[derive(Default)]
pub struct MemoryRegistry {
    /// `(repository, tag or digest)` → (bytes, media type)
    manifests: Mutex<HashMap<(String, String), (Vec<u8>, String)>>,
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
    /// Bytes served instead of the real blob, to simulate corruption
    tampered: Mutex<HashMap<Digest, Vec<u8>>>,
    pub blob_uploads: AtomicUsize,
    pub blob_fetches: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_blob(&self, data: &[u8]) -> Digest {
        let digest = Digest::from_bytes(data);
        self.blobs.lock().insert(digest.clone(), data.to_vec());
        digest
    }

    /// Publish manifest bytes under the reference's tag and its digest.
    pub fn add_manifest(&self, reference: &Reference, data: &[u8], media_type: &str) -> Digest {
        let digest = Digest::from_bytes(data);
        let repo = reference.repository_path();
        let mut manifests = self.manifests.lock();
        manifests.insert(
            (repo.clone(), reference.target()),
            (data.to_vec(), media_type.to_string()),
        );
        manifests.insert(
            (repo, digest.to_string()),
            (data.to_vec(), media_type.to_string()),
        );
        digest
    }

    pub fn tamper(&self, digest: &Digest, data: &[u8]) {
        self.tampered.lock().insert(digest.clone(), data.to_vec());
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blobs.lock().contains_key(digest)
    }

    fn not_found(reference: &Reference, what: String) -> StashError {
        StashError::registry(reference.registry(), RegistryErrorKind::NotFound, what)
    }
}

#[async_trait]
impl Resolver for MemoryRegistry {
    async fn fetch_manifest(&self, reference: &Reference) -> Result<(Vec<u8>, String)> {
        self.manifests
            .lock()
            .get(&(reference.repository_path(), reference.target()))
            .cloned()
            .ok_or_else(|| Self::not_found(reference, format!("manifest {}", reference)))
    }

    async fn fetch_blob(&self, reference: &Reference, digest: &Digest) -> Result<Vec<u8>> {
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(data) = self.tampered.lock().get(digest) {
            return Ok(data.clone());
        }
        self.blobs
            .lock()
            .get(digest)
            .cloned()
            .ok_or_else(|| Self::not_found(reference, format!("blob {}", digest)))
    }

    async fn blob_exists(&self, _reference: &Reference, digest: &Digest) -> Result<bool> {
        Ok(self.has_blob(digest))
    }

    async fn push_blob(
        &self,
        reference: &Reference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor> {
        let descriptor = Descriptor::for_bytes(media_type, data);
        if !self.blob_exists(reference, &descriptor.digest).await? {
            self.blob_uploads.fetch_add(1, Ordering::SeqCst);
            self.add_blob(data);
        }
        Ok(descriptor)
    }

    async fn push_manifest(
        &self,
        reference: &Reference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor> {
        self.add_manifest(reference, data, media_type);
        Ok(Descriptor::for_bytes(media_type, data))
    }
}

pub fn sample_chart(name: &str, version: &str) -> Chart {
    let mut metadata = Metadata::new(name, version);
    metadata.description = Some(format!("The {} chart", name));
    metadata.app_version = Some("1.16.0".to_string());
    Chart::new(metadata)
        .with_file("README.md", format!("# {}\n", name))
        .with_file("values.yaml", "replicaCount: 1\nimage: nginx\n")
        .with_template("templates/deployment.yaml", "kind: Deployment\n")
        .with_template("templates/service.yaml", "kind: Service\n")
}

/// Build a tar+gzip archive from `(path, data)` entries.
pub fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Publish a manifest built from a config blob and `(media type, bytes)`
/// layers. Returns the manifest and its serialized bytes.
pub fn publish(
    registry: &MemoryRegistry,
    locator: &str,
    config: &[u8],
    layers: &[(&str, &[u8])],
) -> (Manifest, Vec<u8>) {
    let reference = Reference::parse(locator).unwrap();
    registry.add_blob(config);
    let config = Descriptor::for_bytes(
        chartstash_registry::manifest::CHART_CONFIG_MEDIA_TYPE,
        config,
    );
    let layers = layers
        .iter()
        .map(|(media_type, data)| {
            registry.add_blob(data);
            Descriptor::for_bytes(*media_type, data)
        })
        .collect();
    let manifest = Manifest::new(config, layers);
    let bytes = manifest.to_vec().unwrap();
    registry.add_manifest(&reference, &bytes, OCI_MANIFEST_MEDIA_TYPE);
    (manifest, bytes)
}
