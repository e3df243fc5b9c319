//! HTTP client construction for registry traffic.

use std::path::Path;

use chartstash_core::config::StashConfig;
use chartstash_core::error::{Result, StashError};
use reqwest::{Certificate, Client, Identity};

/// User agent sent with every registry request.
pub const USER_AGENT: &str = concat!("chartstash/", env!("CARGO_PKG_VERSION"));

/// Build an HTTP client honoring the configured timeout and TLS material.
pub fn build_http_client(config: &StashConfig) -> Result<Client> {
    config.tls.validate()?;

    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.timeout())
        .connect_timeout(config.timeout());

    if let Some(ref ca_file) = config.tls.ca_file {
        let pem = read_pem(ca_file)?;
        let cert = Certificate::from_pem(&pem).map_err(|e| {
            StashError::ConfigError(format!("Invalid CA file {}: {}", ca_file.display(), e))
        })?;
        builder = builder.add_root_certificate(cert);
    }

    if let (Some(cert_file), Some(key_file)) = (&config.tls.cert_file, &config.tls.key_file) {
        let cert = read_pem(cert_file)?;
        let key = read_pem(key_file)?;
        let identity = Identity::from_pkcs8_pem(&cert, &key).map_err(|e| {
            StashError::ConfigError(format!(
                "Invalid client certificate {} / key {}: {}",
                cert_file.display(),
                key_file.display(),
                e
            ))
        })?;
        builder = builder.identity(identity);
    }

    if config.tls.insecure_skip_verify {
        tracing::warn!("TLS certificate verification is disabled for registry connections");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| StashError::ConfigError(format!("Failed to build HTTP client: {}", e)))
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| StashError::io(format!("Failed to read {}", path.display()), e))
}
