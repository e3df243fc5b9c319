//! Chart client: pull, save, push, load and list charts.
//!
//! The client owns no network or disk code of its own. It drives a
//! [`Resolver`] for registry traffic and a [`Cache`] for local storage,
//! and is the only place where descriptors are checked against content.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use chartstash_core::config::{StashConfig, DEFAULT_REGISTRY};
use chartstash_core::error::{Result, StashError};
use comfy_table::Table;

use crate::cache::Cache;
use crate::chart::{ArchiveContents, Chart, Metadata};
use crate::digest::Digest;
use crate::manifest::{
    Descriptor, LayerKind, Manifest, CHART_CONFIG_MEDIA_TYPE, CHART_CONTENT_MEDIA_TYPE,
    CHART_PROVENANCE_MEDIA_TYPE,
};
use crate::reference::Reference;
use crate::resolver::{HttpResolver, Resolver};
use crate::table::{chart_table, ChartRow};

/// Progress of a pull. Every transition is traced at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStage {
    Resolving,
    FetchingManifest,
    DecodingManifest,
    /// Fetching blob `i` of the manifest (0 is the config)
    FetchingLayers(usize),
    VerifyingLayers,
    AssemblingChart,
    WritingCache,
    Done,
    Failed,
}

impl fmt::Display for PullStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolving => write!(f, "resolving"),
            Self::FetchingManifest => write!(f, "fetching manifest"),
            Self::DecodingManifest => write!(f, "decoding manifest"),
            Self::FetchingLayers(i) => write!(f, "fetching blob {}", i),
            Self::VerifyingLayers => write!(f, "verifying blobs"),
            Self::AssemblingChart => write!(f, "assembling chart"),
            Self::WritingCache => write!(f, "writing cache"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a successful pull.
#[derive(Debug, Clone)]
pub struct PulledChart {
    pub reference: Reference,
    /// Descriptor of the manifest as stored in the cache
    pub manifest: Descriptor,
    pub chart: Chart,
    /// Packaged chart archive
    pub archive: Vec<u8>,
}

/// Tracks and traces [`PullStage`] transitions for one pull.
struct StageTracker<'a> {
    locator: &'a str,
    stage: PullStage,
}

impl<'a> StageTracker<'a> {
    fn new(locator: &'a str) -> Self {
        tracing::debug!(locator, stage = %PullStage::Resolving, "Pull started");
        Self {
            locator,
            stage: PullStage::Resolving,
        }
    }

    fn enter(&mut self, next: PullStage) {
        tracing::debug!(locator = self.locator, from = %self.stage, to = %next, "Pull stage");
        self.stage = next;
    }
}

/// Registry client backed by a local cache.
pub struct Client {
    cache: Arc<Cache>,
    resolver: Arc<dyn Resolver>,
    default_registry: String,
}

impl Client {
    /// Open the configured cache and build an HTTP resolver.
    pub fn new(config: &StashConfig) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(Cache::open(&config.cache_root)?);
        let resolver = HttpResolver::new(config)?.into_shared();

        tracing::debug!(
            cache_root = %config.cache_root.display(),
            plain_http = config.plain_http,
            "Created registry client"
        );

        Ok(Self {
            cache,
            resolver,
            default_registry: config.default_registry.clone(),
        })
    }

    /// Assemble a client from an existing cache and resolver.
    pub fn with_parts(cache: Arc<Cache>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            cache,
            resolver,
            default_registry: DEFAULT_REGISTRY.to_string(),
        }
    }

    /// Registry assumed for locators without a host.
    pub fn with_default_registry(mut self, registry: impl Into<String>) -> Self {
        self.default_registry = registry.into();
        self
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn parse_reference(&self, locator: &str) -> Result<Reference> {
        Reference::parse_with_default_host(locator, &self.default_registry)
    }

    /// Pull a chart from its registry into the cache.
    pub async fn pull(&self, locator: &str) -> Result<Chart> {
        Ok(self.pull_chart(locator).await?.chart)
    }

    /// Pull a chart, also returning its manifest descriptor and archive.
    ///
    /// Every blob is verified before anything is written to the cache, so a
    /// failed pull leaves the index untouched.
    pub async fn pull_chart(&self, locator: &str) -> Result<PulledChart> {
        let mut tracker = StageTracker::new(locator);
        match self.pull_stages(locator, &mut tracker).await {
            Ok(pulled) => {
                tracker.enter(PullStage::Done);
                tracing::info!(
                    reference = %pulled.reference,
                    digest = %pulled.manifest.digest,
                    name = %pulled.chart.metadata.name,
                    version = %pulled.chart.metadata.version,
                    "Pulled chart"
                );
                Ok(pulled)
            }
            Err(e) => {
                let failed_at = tracker.stage;
                tracker.enter(PullStage::Failed);
                tracing::warn!(locator, stage = %failed_at, error = %e, "Pull failed");
                Err(e)
            }
        }
    }

    async fn pull_stages(
        &self,
        locator: &str,
        tracker: &mut StageTracker<'_>,
    ) -> Result<PulledChart> {
        let reference = self.parse_reference(locator)?;

        tracker.enter(PullStage::FetchingManifest);
        let (manifest_bytes, reported_type) = self.resolver.fetch_manifest(&reference).await?;
        if let Some(ref pinned) = reference.digest {
            if !pinned.matches(&manifest_bytes) {
                return Err(StashError::Integrity {
                    digest: pinned.to_string(),
                    expected: pinned.to_string(),
                    actual: Digest::from_bytes(&manifest_bytes).to_string(),
                });
            }
        }

        tracker.enter(PullStage::DecodingManifest);
        let manifest = Manifest::from_slice(&manifest_bytes)?;
        if manifest.content_layers().next().is_none() {
            return Err(StashError::MalformedManifest(format!(
                "manifest for {} has no chart content layer",
                reference
            )));
        }
        let manifest_type = manifest.media_type.clone().unwrap_or(reported_type);

        let mut fetched = Vec::with_capacity(manifest.layers.len() + 1);
        for (i, descriptor) in manifest.blobs().enumerate() {
            tracker.enter(PullStage::FetchingLayers(i));
            let data = self.resolver.fetch_blob(&reference, &descriptor.digest).await?;
            fetched.push((descriptor, data));
        }

        tracker.enter(PullStage::VerifyingLayers);
        for (descriptor, data) in &fetched {
            descriptor.verify(data)?;
        }

        tracker.enter(PullStage::AssemblingChart);
        let (config, layers) = fetched
            .split_first()
            .ok_or_else(|| StashError::MalformedManifest("manifest has no config".to_string()))?;
        let chart = assemble_chart(
            &config.1,
            layers.iter().map(|(d, data)| (*d, data.as_slice())),
        )?;
        let archive = packaged_archive(&chart, layers.iter().map(|(d, data)| (*d, data.as_slice())))?;

        tracker.enter(PullStage::WritingCache);
        for (descriptor, data) in &fetched {
            self.cache.put_blob(data, &descriptor.media_type)?;
        }
        let manifest_descriptor =
            self.cache
                .put_manifest_bytes(&reference, &manifest_bytes, &manifest_type)?;

        Ok(PulledChart {
            reference,
            manifest: manifest_descriptor,
            chart,
            archive,
        })
    }

    /// Package `chart` into the cache under `locator`. No network access.
    pub fn save(&self, chart: &Chart, locator: &str) -> Result<Descriptor> {
        let reference = self.parse_reference(locator)?;
        if reference.digest.is_some() {
            return Err(StashError::invalid_reference(
                locator,
                "cannot save under a digest; use a tag",
            ));
        }
        chart.validate()?;

        let config = self
            .cache
            .put_blob(&chart.config_json()?, CHART_CONFIG_MEDIA_TYPE)?;
        let mut layers = vec![self
            .cache
            .put_blob(&chart.package()?, CHART_CONTENT_MEDIA_TYPE)?];
        if let Some(ref provenance) = chart.provenance {
            layers.push(self.cache.put_blob(provenance, CHART_PROVENANCE_MEDIA_TYPE)?);
        }

        let manifest = Manifest::new(config, layers);
        let descriptor = self.cache.put_manifest(&reference, &manifest)?;

        tracing::info!(
            reference = %reference,
            digest = %descriptor.digest,
            name = %chart.metadata.name,
            version = %chart.metadata.version,
            "Saved chart"
        );
        Ok(descriptor)
    }

    /// Publish a cached chart to its registry.
    pub async fn push(&self, locator: &str) -> Result<Descriptor> {
        let reference = self.parse_reference(locator)?;
        let (manifest, descriptor) = self.cache.get_manifest(&reference)?;
        let manifest_bytes = self.cache.get_blob(&descriptor.digest)?;

        for blob in manifest.blobs() {
            let data = self.cache.get_blob(&blob.digest)?;
            self.resolver
                .push_blob(&reference, &data, &blob.media_type)
                .await?;
        }
        let pushed = self
            .resolver
            .push_manifest(&reference, &manifest_bytes, &descriptor.media_type)
            .await?;

        tracing::info!(reference = %reference, digest = %pushed.digest, "Pushed chart");
        Ok(pushed)
    }

    /// Assemble a chart from the cache alone.
    pub fn load(&self, locator: &str) -> Result<Chart> {
        let reference = self.parse_reference(locator)?;
        let (manifest, _) = self.cache.get_manifest(&reference)?;

        let config = self.cache.get_blob(&manifest.config.digest)?;
        let mut layers = Vec::new();
        for descriptor in &manifest.layers {
            if LayerKind::of(&descriptor.media_type) != LayerKind::Unknown {
                layers.push((descriptor, self.cache.get_blob(&descriptor.digest)?));
            }
        }

        let chart = assemble_chart(&config, layers.iter().map(|(d, data)| (*d, data.as_slice())))?;
        tracing::debug!(reference = %reference, name = %chart.metadata.name, "Loaded chart from cache");
        Ok(chart)
    }

    /// Drop `locator` from the cache index.
    pub fn remove(&self, locator: &str) -> Result<()> {
        let reference = self.parse_reference(locator)?;
        if !self.cache.remove_reference(&reference)? {
            return Err(StashError::NotFound(format!("reference {}", reference)));
        }
        Ok(())
    }

    /// One row per indexed reference, in reference order.
    pub fn chart_rows(&self) -> Result<Vec<ChartRow>> {
        let mut rows = Vec::new();
        for entry in self.cache.list_references() {
            let manifest = Manifest::from_slice(&self.cache.get_blob(&entry.manifest.digest)?)?;
            let config = self.cache.get_blob(&manifest.config.digest)?;

            let (name, version) = match serde_json::from_slice::<Metadata>(&config) {
                Ok(metadata) => (metadata.name, metadata.version),
                Err(_) => (
                    entry.reference.name().to_string(),
                    entry.reference.tag.clone().unwrap_or_default(),
                ),
            };
            let size = manifest
                .blobs()
                .map(|d| d.size.max(0) as u64)
                .sum::<u64>();

            rows.push(ChartRow {
                reference: entry.reference.to_string(),
                name,
                version,
                digest: entry.manifest.digest,
                size,
                updated: entry.updated,
            });
        }
        Ok(rows)
    }

    pub fn chart_table(&self) -> Result<Table> {
        Ok(chart_table(&self.chart_rows()?))
    }

    /// Write the chart table to `writer`.
    pub fn print_chart_table(&self, writer: &mut dyn Write) -> Result<()> {
        let table = self.chart_table()?;
        writeln!(writer, "{}", table)
            .map_err(|e| StashError::io("Failed to write chart table", e))
    }
}

/// Build a chart from its config blob and layers.
///
/// Content archives unpack in order; later entries override earlier ones.
/// Metadata comes from `Chart.yaml` when present, else from the config.
fn assemble_chart<'a>(
    config: &[u8],
    layers: impl IntoIterator<Item = (&'a Descriptor, &'a [u8])>,
) -> Result<Chart> {
    let fallback = match serde_json::from_slice::<Metadata>(config) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            tracing::debug!(error = %e, "Config blob is not chart metadata");
            None
        }
    };

    let mut contents = ArchiveContents::default();
    let mut provenance = None;
    let mut content_layers = 0;
    for (descriptor, data) in layers {
        match LayerKind::of(&descriptor.media_type) {
            LayerKind::Content => {
                contents.unpack(data)?;
                content_layers += 1;
            }
            LayerKind::Provenance => provenance = Some(data.to_vec()),
            LayerKind::Unknown => {
                tracing::debug!(media_type = %descriptor.media_type, digest = %descriptor.digest, "Ignoring unknown layer");
            }
        }
    }
    if content_layers == 0 {
        return Err(StashError::MalformedManifest(
            "no chart content layer".to_string(),
        ));
    }

    contents.into_chart(fallback, provenance)
}

/// The archive as published when there is exactly one, else a fresh package.
fn packaged_archive<'a>(
    chart: &Chart,
    layers: impl IntoIterator<Item = (&'a Descriptor, &'a [u8])>,
) -> Result<Vec<u8>> {
    let mut content = layers
        .into_iter()
        .filter(|(d, _)| LayerKind::of(&d.media_type) == LayerKind::Content);
    match (content.next(), content.next()) {
        (Some((_, data)), None) => Ok(data.to_vec()),
        _ => chart.package(),
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("cache_root", &self.cache.root())
            .field("default_registry", &self.default_registry)
            .finish()
    }
}
