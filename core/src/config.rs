use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StashError};
use crate::log::LogConfig;

/// Registry host substituted when a locator names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Default network timeout for a single registry request.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Default upper bound for a single blob body: 512 MiB.
pub const DEFAULT_MAX_BLOB_SIZE: u64 = 512 * 1024 * 1024;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StashConfig {
    /// Cache root directory (blobs/, index/, tmp/ live below it)
    pub cache_root: PathBuf,

    /// Registry used when a locator has no host
    pub default_registry: String,

    /// Per-request network timeout in seconds
    pub timeout_secs: u64,

    /// TLS material for registry connections
    pub tls: TlsConfig,

    /// Talk plain HTTP instead of HTTPS
    pub plain_http: bool,

    /// Registry credentials file
    pub credentials_file: PathBuf,

    /// Largest blob body accepted from a registry, in bytes
    pub max_blob_size: u64,

    /// Enable debug output
    pub debug: bool,

    /// Logging output
    pub log: LogConfig,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            default_registry: DEFAULT_REGISTRY.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            tls: TlsConfig::default(),
            plain_http: false,
            credentials_file: default_credentials_file(),
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            debug: false,
            log: LogConfig::default(),
        }
    }
}

impl StashConfig {
    /// Load a configuration from a YAML file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            StashError::io(format!("Failed to read config {}", path.display()), e)
        })?;
        let config: StashConfig = serde_yaml::from_str(&data).map_err(|e| {
            StashError::ConfigError(format!("Failed to parse config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `CHARTSTASH_CACHE_ROOT`, `CHARTSTASH_REGISTRY_CONFIG`
    /// and `CHARTSTASH_DEBUG`.
    pub fn apply_env(mut self) -> Self {
        if let Ok(root) = std::env::var("CHARTSTASH_CACHE_ROOT") {
            if !root.is_empty() {
                self.cache_root = PathBuf::from(root);
            }
        }
        if let Ok(path) = std::env::var("CHARTSTASH_REGISTRY_CONFIG") {
            if !path.is_empty() {
                self.credentials_file = PathBuf::from(path);
            }
        }
        if let Ok(debug) = std::env::var("CHARTSTASH_DEBUG") {
            self.debug = matches!(debug.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        self
    }

    /// Network timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reject configurations that cannot produce a working client.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(StashError::ConfigError(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.default_registry.trim().is_empty() {
            return Err(StashError::ConfigError(
                "default_registry must not be empty".to_string(),
            ));
        }
        if self.max_blob_size == 0 {
            return Err(StashError::ConfigError(
                "max_blob_size must be greater than zero".to_string(),
            ));
        }
        self.tls.validate()
    }
}

/// TLS configuration for registry connections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Client certificate (PEM)
    pub cert_file: Option<PathBuf>,

    /// Client private key (PKCS#8 PEM)
    pub key_file: Option<PathBuf>,

    /// Extra CA bundle (PEM)
    pub ca_file: Option<PathBuf>,

    /// Skip server certificate verification
    pub insecure_skip_verify: bool,
}

impl TlsConfig {
    /// A client certificate needs both halves.
    pub fn validate(&self) -> Result<()> {
        match (&self.cert_file, &self.key_file) {
            (Some(_), None) => Err(StashError::ConfigError(
                "tls.cert_file is set but tls.key_file is missing".to_string(),
            )),
            (None, Some(_)) => Err(StashError::ConfigError(
                "tls.key_file is set but tls.cert_file is missing".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn has_client_identity(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("chartstash")
        .join("registry")
        .join("cache")
}

fn default_credentials_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("chartstash")
        .join("registry.json")
}
