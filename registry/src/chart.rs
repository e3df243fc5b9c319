//! Chart model and its content archive (tar+gzip).
//!
//! Archives are laid out the way chart packages always are:
//!
//! ```text
//! <name>/Chart.yaml
//! <name>/values.yaml
//! <name>/templates/deployment.yaml
//! ```
//!
//! Packing is deterministic: entries are sorted by path and carry zeroed
//! timestamps and ownership, so identical content always hashes to the same
//! digest.

use std::collections::BTreeMap;
use std::io::Read;

use chartstash_core::error::{Result, StashError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder, EntryType, Header};

/// Chart metadata file at the chart root.
pub const CHART_FILE: &str = "Chart.yaml";

/// Directory holding renderable templates.
pub const TEMPLATES_DIR: &str = "templates/";

pub const API_VERSION_V1: &str = "v1";
pub const API_VERSION_V2: &str = "v2";

/// Limit on the total unpacked size of one content archive.
pub const MAX_UNPACKED_SIZE: u64 = 100 * 1024 * 1024;

/// Chart metadata, stored as `Chart.yaml` and as the config blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub api_version: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_version: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deprecated: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Metadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            api_version: API_VERSION_V2.to_string(),
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.api_version.is_empty() {
            return Err(StashError::InvalidChart("apiVersion is required".to_string()));
        }
        if self.name.is_empty() {
            return Err(StashError::InvalidChart("name is required".to_string()));
        }
        if self.name.contains(['/', '\\']) || self.name == "." || self.name == ".." {
            return Err(StashError::InvalidChart(format!(
                "chart name '{}' is not a valid directory name",
                self.name
            )));
        }
        if self.version.is_empty() {
            return Err(StashError::InvalidChart("version is required".to_string()));
        }
        Ok(())
    }
}

/// A file inside a chart, addressed by its path relative to the chart root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartFile {
    pub name: String,
    pub data: Vec<u8>,
}

impl ChartFile {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// A packaged chart.
///
/// Two charts are equal when they hold the same metadata, provenance and
/// path → content mapping; the order of `files` and `templates` is not
/// significant, since packaging sorts entries by path.
#[derive(Debug, Clone)]
pub struct Chart {
    pub metadata: Metadata,
    /// Non-template files (values.yaml, README.md, ...)
    pub files: Vec<ChartFile>,
    /// Files under `templates/`
    pub templates: Vec<ChartFile>,
    /// Provenance (signature) file, stored as its own layer
    pub provenance: Option<Vec<u8>>,
}

impl Chart {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            files: Vec::new(),
            templates: Vec::new(),
            provenance: None,
        }
    }

    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.files.push(ChartFile::new(name, data));
        self
    }

    pub fn with_template(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.templates.push(ChartFile::new(name, data));
        self
    }

    /// Check metadata and file paths before packing.
    pub fn validate(&self) -> Result<()> {
        self.metadata.validate()?;

        let mut seen = std::collections::HashSet::new();
        for file in &self.files {
            validate_path(&file.name)?;
            if file.name == CHART_FILE {
                return Err(StashError::InvalidChart(format!(
                    "'{}' is reserved for chart metadata",
                    CHART_FILE
                )));
            }
            if file.name.starts_with(TEMPLATES_DIR) {
                return Err(StashError::InvalidChart(format!(
                    "file '{}' belongs in templates",
                    file.name
                )));
            }
            if !seen.insert(file.name.as_str()) {
                return Err(StashError::InvalidChart(format!(
                    "duplicate path '{}'",
                    file.name
                )));
            }
        }
        for template in &self.templates {
            validate_path(&template.name)?;
            if !template.name.starts_with(TEMPLATES_DIR) {
                return Err(StashError::InvalidChart(format!(
                    "template '{}' must live under {}",
                    template.name, TEMPLATES_DIR
                )));
            }
            if !seen.insert(template.name.as_str()) {
                return Err(StashError::InvalidChart(format!(
                    "duplicate path '{}'",
                    template.name
                )));
            }
        }
        Ok(())
    }

    /// Pack metadata, files and templates into a deterministic tar+gzip archive.
    pub fn package(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let chart_yaml = serde_yaml::to_string(&self.metadata)?;
        let mut entries: Vec<(&str, &[u8])> = Vec::with_capacity(self.files.len() + self.templates.len() + 1);
        entries.push((CHART_FILE, chart_yaml.as_bytes()));
        entries.extend(self.files.iter().map(|f| (f.name.as_str(), f.data.as_slice())));
        entries.extend(self.templates.iter().map(|f| (f.name.as_str(), f.data.as_slice())));
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = Builder::new(encoder);

        for (name, data) in entries {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_cksum();

            let path = format!("{}/{}", self.metadata.name, name);
            builder
                .append_data(&mut header, &path, data)
                .map_err(|e| StashError::io(format!("Failed to add {} to chart archive", path), e))?;
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| StashError::io("Failed to finish chart archive", e))?;
        encoder
            .finish()
            .map_err(|e| StashError::io("Failed to compress chart archive", e))
    }

    /// Config blob: the metadata as JSON.
    pub fn config_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.metadata)?)
    }
}

impl PartialEq for Chart {
    fn eq(&self, other: &Self) -> bool {
        self.metadata == other.metadata
            && self.provenance == other.provenance
            && by_path(&self.files) == by_path(&other.files)
            && by_path(&self.templates) == by_path(&other.templates)
    }
}

impl Eq for Chart {}

fn by_path(files: &[ChartFile]) -> Vec<&ChartFile> {
    let mut sorted: Vec<&ChartFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    sorted
}

/// Paths must be relative, without empty, `.` or `..` components.
fn validate_path(path: &str) -> Result<()> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path
            .split('/')
            .any(|c| c.is_empty() || c == "." || c == "..");
    if bad {
        return Err(StashError::InvalidChart(format!("invalid path '{}'", path)));
    }
    Ok(())
}

/// Entries collected from one or more content archives.
#[derive(Debug, Default)]
pub struct ArchiveContents {
    pub metadata: Option<Metadata>,
    pub entries: BTreeMap<String, Vec<u8>>,
}

impl ArchiveContents {
    /// Unpack one content archive. Later calls on the same value overlay
    /// earlier entries with the same path.
    pub fn unpack(&mut self, data: &[u8]) -> Result<()> {
        let mut archive = Archive::new(GzDecoder::new(data));
        let entries = archive
            .entries()
            .map_err(|e| StashError::InvalidChart(format!("unreadable archive: {}", e)))?;

        let mut total: u64 = 0;
        for entry in entries {
            let mut entry =
                entry.map_err(|e| StashError::InvalidChart(format!("unreadable archive entry: {}", e)))?;

            match entry.header().entry_type() {
                EntryType::Regular | EntryType::Continuous => {}
                EntryType::Directory => continue,
                other => {
                    tracing::debug!(entry_type = ?other, "Skipping non-regular archive entry");
                    continue;
                }
            }

            let path = {
                let path = entry
                    .path()
                    .map_err(|e| StashError::InvalidChart(format!("bad entry path: {}", e)))?;
                path.to_str()
                    .ok_or_else(|| StashError::InvalidChart("entry path is not UTF-8".to_string()))?
                    .trim_start_matches("./")
                    .to_string()
            };

            // Drop the top-level chart directory.
            let relative = match path.split_once('/') {
                Some((_, rest)) if !rest.is_empty() => rest.to_string(),
                _ => {
                    return Err(StashError::InvalidChart(format!(
                        "entry '{}' is outside the chart directory",
                        path
                    )))
                }
            };
            validate_path(&relative)?;

            let remaining = MAX_UNPACKED_SIZE - total;
            let mut buf = Vec::new();
            (&mut entry)
                .take(remaining + 1)
                .read_to_end(&mut buf)
                .map_err(|e| StashError::InvalidChart(format!("unreadable entry '{}': {}", path, e)))?;
            total += buf.len() as u64;
            if total > MAX_UNPACKED_SIZE {
                return Err(StashError::InvalidChart(format!(
                    "archive unpacks to more than {} bytes",
                    MAX_UNPACKED_SIZE
                )));
            }

            if relative == CHART_FILE {
                self.metadata = Some(serde_yaml::from_slice(&buf).map_err(|e| {
                    StashError::InvalidChart(format!("invalid {}: {}", CHART_FILE, e))
                })?);
            } else {
                self.entries.insert(relative, buf);
            }
        }
        Ok(())
    }

    /// Assemble a chart. `fallback` supplies metadata when no archive had a `Chart.yaml`.
    pub fn into_chart(self, fallback: Option<Metadata>, provenance: Option<Vec<u8>>) -> Result<Chart> {
        let metadata = self
            .metadata
            .or(fallback)
            .ok_or_else(|| StashError::InvalidChart(format!("no {} found", CHART_FILE)))?;

        let mut chart = Chart::new(metadata);
        chart.provenance = provenance;
        for (name, data) in self.entries {
            if name.starts_with(TEMPLATES_DIR) {
                chart.templates.push(ChartFile { name, data });
            } else {
                chart.files.push(ChartFile { name, data });
            }
        }
        Ok(chart)
    }
}
