//! Registry credentials.
//!
//! Per-registry entries are read from a JSON file (by default
//! `<config dir>/chartstash/registry.json`). Managing that file is left to
//! whatever wrote it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chartstash_core::error::{Result, StashError};
use serde::Deserialize;

/// Environment variables consulted when the file has no entry.
pub const ENV_USERNAME: &str = "CHARTSTASH_REGISTRY_USERNAME";
pub const ENV_PASSWORD: &str = "CHARTSTASH_REGISTRY_PASSWORD";

/// Stored entry. Either a username/password pair or a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum CredentialEntry {
    Basic { username: String, password: String },
    Token { token: String },
}

#[derive(Debug, Default, Deserialize)]
struct CredentialFile {
    registries: BTreeMap<String, CredentialEntry>,
}

/// Pre-resolved authentication handed to a resolver.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegistryAuth {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    Bearer(String),
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::Anonymous
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(token.into())
    }

    /// Basic auth from [`ENV_USERNAME`]/[`ENV_PASSWORD`], else anonymous.
    pub fn from_env() -> Self {
        match (std::env::var(ENV_USERNAME), std::env::var(ENV_PASSWORD)) {
            (Ok(username), Ok(password)) => Self::basic(username, password),
            _ => Self::Anonymous,
        }
    }

    /// Credentials for `registry`: the store's entry, then the environment,
    /// then anonymous.
    pub fn resolve(store: &CredentialStore, registry: &str) -> Result<Self> {
        if let Some(auth) = store.get(registry)? {
            tracing::debug!(registry, "Using stored registry credentials");
            return Ok(auth);
        }
        Ok(Self::from_env())
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

/// Read-only view of a JSON credential file:
///
/// ```json
/// { "registries": { "ghcr.io": { "username": "u", "password": "p" },
///                   "localhost:5000": { "token": "t" } } }
/// ```
///
/// The file is read on every lookup; a missing file has no entries.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, registry: &str) -> Result<Option<RegistryAuth>> {
        let registry = normalize_registry(registry);
        let file = self.load()?;
        Ok(file
            .registries
            .into_iter()
            .find(|(name, _)| normalize_registry(name) == registry)
            .map(|(_, entry)| match entry {
                CredentialEntry::Basic { username, password } => {
                    RegistryAuth::basic(username, password)
                }
                CredentialEntry::Token { token } => RegistryAuth::bearer(token),
            }))
    }

    fn load(&self) -> Result<CredentialFile> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CredentialFile::default())
            }
            Err(e) => {
                return Err(StashError::io(
                    format!("Failed to read credential store {}", self.path.display()),
                    e,
                ))
            }
        };
        serde_json::from_str(&data).map_err(|e| {
            StashError::ConfigError(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Docker Hub aliases share one entry.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}
