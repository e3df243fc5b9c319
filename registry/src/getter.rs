//! `oci://` chart getter.
//!
//! Resolves an `oci://host/path/chart` href (plus an optional version) to
//! packaged chart bytes by pulling through a [`Client`].

use std::path::PathBuf;
use std::time::Duration;

use chartstash_core::config::StashConfig;
use chartstash_core::error::Result;

use crate::client::Client;

/// Scheme prefix handled by [`OciGetter`].
pub const OCI_SCHEME: &str = "oci://";

/// Options a getter is configured with.
#[derive(Debug, Clone, Default)]
pub struct GetterOptions {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
    pub plain_http: bool,
    pub timeout: Option<Duration>,
    pub cache_root: Option<PathBuf>,
    pub credentials_file: Option<PathBuf>,
    /// Appended to the href as its tag
    pub version: Option<String>,
}

impl GetterOptions {
    /// Overlay these options on `base`.
    pub fn apply(&self, base: StashConfig) -> StashConfig {
        let mut config = base;
        if self.cert_file.is_some() {
            config.tls.cert_file = self.cert_file.clone();
        }
        if self.key_file.is_some() {
            config.tls.key_file = self.key_file.clone();
        }
        if self.ca_file.is_some() {
            config.tls.ca_file = self.ca_file.clone();
        }
        config.tls.insecure_skip_verify |= self.insecure_skip_verify;
        config.plain_http |= self.plain_http;
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout.as_secs().max(1);
        }
        if let Some(ref root) = self.cache_root {
            config.cache_root = root.clone();
        }
        if let Some(ref path) = self.credentials_file {
            config.credentials_file = path.clone();
        }
        config
    }
}

pub struct OciGetter {
    client: Client,
    version: Option<String>,
}

impl OciGetter {
    /// Build a getter on top of the default configuration and environment.
    pub fn new(options: GetterOptions) -> Result<Self> {
        Self::with_config(StashConfig::default().apply_env(), options)
    }

    pub fn with_config(config: StashConfig, options: GetterOptions) -> Result<Self> {
        let config = options.apply(config);
        Ok(Self {
            client: Client::new(&config)?,
            version: options.version,
        })
    }

    /// Use an existing client.
    pub fn with_client(client: Client, version: Option<String>) -> Self {
        Self { client, version }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Locator the href resolves to.
    pub fn locator(&self, href: &str) -> String {
        let locator = href.strip_prefix(OCI_SCHEME).unwrap_or(href);
        match self.version.as_deref() {
            Some(version) if !version.is_empty() => format!("{}:{}", locator, version),
            _ => locator.to_string(),
        }
    }

    /// Pull `href` and return the packaged chart.
    pub async fn get(&self, href: &str) -> Result<Vec<u8>> {
        let locator = self.locator(href);
        tracing::debug!(href, locator = %locator, "Fetching chart");
        Ok(self.client.pull_chart(&locator).await?.archive)
    }
}
