//! Chart reference parsing.
//!
//! Parses locators like `localhost:5000/charts/mychart:1.2.3` into structured components.

use std::fmt;
use std::str::FromStr;

use chartstash_core::config::DEFAULT_REGISTRY;
use chartstash_core::error::{Result, StashError};

use crate::digest::Digest;

/// Default tag when the locator carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// Longest tag a registry accepts.
const MAX_TAG_LEN: usize = 128;

/// Parsed chart reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Registry hostname, lower-cased (e.g., "localhost", "ghcr.io")
    pub host: String,
    /// Registry port, if given
    pub port: Option<u16>,
    /// Repository path segments (e.g., ["charts", "mychart"])
    pub repository: Vec<String>,
    /// Tag (e.g., "1.2.3")
    pub tag: Option<String>,
    /// Manifest digest
    pub digest: Option<Digest>,
}

impl Reference {
    /// Parse a locator, substituting [`DEFAULT_REGISTRY`] when it names no host.
    pub fn parse(locator: &str) -> Result<Self> {
        Self::parse_with_default_host(locator, DEFAULT_REGISTRY)
    }

    /// Parse a locator of the form `[host[:port]/]path[:tag][@digest]`.
    ///
    /// Formats:
    /// - `mychart` → <default>/mychart:latest
    /// - `charts/mychart:1.0` → <default>/charts/mychart:1.0
    /// - `localhost:5000/chart0:latest` → localhost:5000/chart0:latest
    /// - `ghcr.io/org/chart@sha256:abc...` → ghcr.io/org/chart@sha256:abc...
    pub fn parse_with_default_host(locator: &str, default_host: &str) -> Result<Self> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(StashError::invalid_reference(locator, "empty reference"));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match locator.split_once('@') {
            Some((name_tag, digest_part)) => {
                if digest_part.contains('@') {
                    return Err(StashError::invalid_reference(
                        locator,
                        "multiple '@' digest markers",
                    ));
                }
                let digest = Digest::parse(digest_part).map_err(|e| {
                    StashError::invalid_reference(locator, format!("malformed digest: {}", e))
                })?;
                (name_tag, Some(digest))
            }
            None => (locator, None),
        };

        // Tag is after the last ':' of the final path segment, so a
        // registry port never reads as a tag.
        let last_segment = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment..].rfind(':') {
            Some(colon) => {
                let split = last_segment + colon;
                (&name_tag[..split], Some(&name_tag[split + 1..]))
            }
            None => (name_tag, None),
        };

        if let Some(tag) = tag {
            validate_tag(locator, tag)?;
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if looks_like_host(first) => (first, rest),
            _ => (default_host, name),
        };
        let (host, port) = split_host_port(locator, registry)?;
        let repository = split_repository(locator, repository)?;

        // Apply default tag if no tag and no digest
        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_TAG.to_string()),
        };

        Ok(Reference {
            host,
            port,
            repository,
            tag,
            digest,
        })
    }

    /// `host[:port]`, as used in registry URLs and credential lookups.
    pub fn registry(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// Repository path joined with `/`.
    pub fn repository_path(&self) -> String {
        self.repository.join("/")
    }

    /// Last repository segment, the chart's short name.
    pub fn name(&self) -> &str {
        self.repository.last().map(String::as_str).unwrap_or_default()
    }

    /// What the registry resolves: the digest when pinned, else the tag.
    pub fn target(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry(), self.repository_path());
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl FromStr for Reference {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// First component is a registry if it contains a dot or colon, or is "localhost".
fn looks_like_host(component: &str) -> bool {
    component.contains('.')
        || component.contains(':')
        || component.eq_ignore_ascii_case("localhost")
}

fn split_host_port(locator: &str, registry: &str) -> Result<(String, Option<u16>)> {
    let (host, port) = match registry.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                StashError::invalid_reference(locator, format!("invalid port '{}'", port))
            })?;
            (host, Some(port))
        }
        None => (registry, None),
    };

    let host = host.to_lowercase();
    if host.is_empty() {
        return Err(StashError::invalid_reference(locator, "empty registry host"));
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(StashError::invalid_reference(
            locator,
            format!("illegal character in host '{}'", host),
        ));
    }
    Ok((host, port))
}

fn split_repository(locator: &str, repository: &str) -> Result<Vec<String>> {
    if repository.is_empty() {
        return Err(StashError::invalid_reference(locator, "empty repository"));
    }

    repository
        .split('/')
        .map(|segment| {
            if segment.is_empty() {
                return Err(StashError::invalid_reference(
                    locator,
                    "empty repository segment",
                ));
            }
            if !segment
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '_' | '-'))
            {
                return Err(StashError::invalid_reference(
                    locator,
                    format!("illegal character in repository segment '{}'", segment),
                ));
            }
            Ok(segment.to_string())
        })
        .collect()
}

fn validate_tag(locator: &str, tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let valid_first = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if !valid_first || !valid_rest || tag.len() > MAX_TAG_LEN {
        return Err(StashError::invalid_reference(
            locator,
            format!("invalid tag '{}'", tag),
        ));
    }
    Ok(())
}
