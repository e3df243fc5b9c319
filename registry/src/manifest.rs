//! OCI descriptors and manifests for chart artifacts.

use std::collections::BTreeMap;

use chartstash_core::error::{Result, StashError};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// OCI image manifest.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Docker v2 schema 2 manifest, served by registries that predate OCI.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Chart metadata config blob.
pub const CHART_CONFIG_MEDIA_TYPE: &str = "application/vnd.cncf.helm.config.v1+json";

/// Chart content archive (tar+gzip).
pub const CHART_CONTENT_MEDIA_TYPE: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";

/// Content archive media type used by older clients.
pub const LEGACY_CHART_CONTENT_MEDIA_TYPE: &str = "application/tar+gzip";

/// Chart provenance (signature) file.
pub const CHART_PROVENANCE_MEDIA_TYPE: &str = "application/vnd.cncf.helm.chart.provenance.v1.prov";

/// Manifest media types accepted from a registry.
pub const ACCEPTED_MANIFEST_MEDIA_TYPES: &[&str] =
    &[OCI_MANIFEST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE];

/// Upper bound for a manifest document.
pub const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

/// What a layer carries, by media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Content,
    Provenance,
    Unknown,
}

impl LayerKind {
    pub fn of(media_type: &str) -> Self {
        match media_type {
            CHART_CONTENT_MEDIA_TYPE | LEGACY_CHART_CONTENT_MEDIA_TYPE => Self::Content,
            CHART_PROVENANCE_MEDIA_TYPE => Self::Provenance,
            _ => Self::Unknown,
        }
    }
}

/// A reference to one addressable blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Describe `data` under the given media type.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: Digest::from_bytes(data),
            size: data.len() as i64,
            annotations: BTreeMap::new(),
        }
    }

    /// Check `data` against the declared size and digest.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        if data.len() as i64 != self.size {
            return Err(StashError::Integrity {
                digest: self.digest.to_string(),
                expected: format!("size {}", self.size),
                actual: format!("size {}", data.len()),
            });
        }
        if !self.digest.matches(data) {
            return Err(StashError::Integrity {
                digest: self.digest.to_string(),
                expected: self.digest.to_string(),
                actual: Digest::from_bytes(data).to_string(),
            });
        }
        Ok(())
    }
}

/// OCI image manifest describing one chart version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Build a chart manifest from its config and layer descriptors.
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
            config,
            layers,
            annotations: BTreeMap::new(),
        }
    }

    /// Decode manifest bytes, rejecting unknown schemas and media types.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_MANIFEST_SIZE {
            return Err(StashError::MalformedManifest(format!(
                "manifest is {} bytes, limit is {}",
                data.len(),
                MAX_MANIFEST_SIZE
            )));
        }
        let manifest: Manifest = serde_json::from_slice(data)
            .map_err(|e| StashError::MalformedManifest(e.to_string()))?;

        if manifest.schema_version != 2 {
            return Err(StashError::MalformedManifest(format!(
                "unsupported schemaVersion {}",
                manifest.schema_version
            )));
        }
        if let Some(ref media_type) = manifest.media_type {
            if !ACCEPTED_MANIFEST_MEDIA_TYPES.contains(&media_type.as_str()) {
                return Err(StashError::MalformedManifest(format!(
                    "unsupported manifest media type '{}'",
                    media_type
                )));
            }
        }
        if manifest.config.size < 0 || manifest.layers.iter().any(|l| l.size < 0) {
            return Err(StashError::MalformedManifest(
                "descriptor with negative size".to_string(),
            ));
        }
        Ok(manifest)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Layers carrying chart content, in manifest order.
    pub fn content_layers(&self) -> impl Iterator<Item = &Descriptor> {
        self.layers
            .iter()
            .filter(|l| LayerKind::of(&l.media_type) == LayerKind::Content)
    }

    pub fn provenance_layer(&self) -> Option<&Descriptor> {
        self.layers
            .iter()
            .find(|l| LayerKind::of(&l.media_type) == LayerKind::Provenance)
    }

    /// Config followed by every layer.
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        let config = Descriptor::for_bytes(CHART_CONFIG_MEDIA_TYPE, b"{}");
        let content = Descriptor::for_bytes(CHART_CONTENT_MEDIA_TYPE, b"archive");
        let prov = Descriptor::for_bytes(CHART_PROVENANCE_MEDIA_TYPE, b"signature");
        Manifest::new(config, vec![content, prov])
    }

    #[test]
    fn test_wire_format_field_names() {
        let json: serde_json::Value = serde_json::from_slice(&sample().to_vec().unwrap()).unwrap();
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["mediaType"], OCI_MANIFEST_MEDIA_TYPE);
        assert_eq!(json["config"]["mediaType"], CHART_CONFIG_MEDIA_TYPE);
        assert_eq!(json["config"]["size"], 2);
        assert!(json["config"]["digest"].as_str().unwrap().starts_with("sha256:"));
        assert!(json["config"].get("annotations").is_none());
        assert_eq!(json["layers"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_from_slice_accepts_own_output() {
        let manifest = sample();
        let decoded = Manifest::from_slice(&manifest.to_vec().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn test_from_slice_without_media_type() {
        let config = Descriptor::for_bytes(CHART_CONFIG_MEDIA_TYPE, b"{}");
        let raw = serde_json::json!({
            "schemaVersion": 2,
            "config": config,
            "layers": []
        });
        let manifest = Manifest::from_slice(raw.to_string().as_bytes()).unwrap();
        assert!(manifest.media_type.is_none());
        assert!(manifest.layers.is_empty());
    }

    #[test]
    fn test_from_slice_rejects_schema_version() {
        let mut manifest = sample();
        manifest.schema_version = 1;
        let err = Manifest::from_slice(&manifest.to_vec().unwrap()).unwrap_err();
        assert!(matches!(err, StashError::MalformedManifest(_)));
    }

    #[test]
    fn test_from_slice_rejects_index_media_type() {
        let mut manifest = sample();
        manifest.media_type = Some("application/vnd.oci.image.index.v1+json".to_string());
        assert!(Manifest::from_slice(&manifest.to_vec().unwrap()).is_err());
    }

    #[test]
    fn test_from_slice_rejects_garbage() {
        assert!(matches!(
            Manifest::from_slice(b"not json"),
            Err(StashError::MalformedManifest(_))
        ));
        assert!(Manifest::from_slice(br#"{"schemaVersion":2,"config":{"mediaType":"","digest":"","size":0}}"#).is_err());
    }

    #[test]
    fn test_layer_classification() {
        let manifest = sample();
        assert_eq!(manifest.content_layers().count(), 1);
        assert!(manifest.provenance_layer().is_some());
        assert_eq!(LayerKind::of(LEGACY_CHART_CONTENT_MEDIA_TYPE), LayerKind::Content);
        assert_eq!(LayerKind::of("application/octet-stream"), LayerKind::Unknown);
        assert_eq!(manifest.blobs().count(), 3);
    }

    #[test]
    fn test_descriptor_verify() {
        let desc = Descriptor::for_bytes(CHART_CONTENT_MEDIA_TYPE, b"payload");
        assert!(desc.verify(b"payload").is_ok());
        assert!(matches!(desc.verify(b"payloaX"), Err(StashError::Integrity { .. })));
        assert!(matches!(desc.verify(b"payload!"), Err(StashError::Integrity { .. })));
    }
}
