use std::fmt;

use thiserror::Error;

/// Classification of a failure reported by a remote registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryErrorKind {
    /// Manifest or blob does not exist on the registry
    NotFound,
    /// Credentials missing or rejected (401/403)
    Auth,
    /// Connection-level failure
    Network,
    /// Request exceeded the configured timeout
    Timeout,
    /// Registry answered with something the protocol does not allow
    Protocol,
}

impl RegistryErrorKind {
    /// Timeouts are network failures too.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network | Self::Timeout)
    }
}

impl fmt::Display for RegistryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Auth => write!(f, "authentication failed"),
            Self::Network => write!(f, "network error"),
            Self::Timeout => write!(f, "timeout"),
            Self::Protocol => write!(f, "protocol error"),
        }
    }
}

/// chartstash error types
#[derive(Error, Debug)]
pub enum StashError {
    /// Malformed locator string
    #[error("Invalid reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Failure talking to a remote registry
    #[error("Registry error: {registry} {kind} - {message}")]
    Registry {
        registry: String,
        kind: RegistryErrorKind,
        message: String,
    },

    /// Manifest bytes could not be decoded into a supported manifest
    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    /// Received content does not match its descriptor
    #[error("Integrity check failed for {digest}: expected {expected}, got {actual}")]
    Integrity {
        digest: String,
        expected: String,
        actual: String,
    },

    /// Reference or blob is absent from the local cache
    #[error("Not found: {0}")]
    NotFound(String),

    /// Filesystem failure with context
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Bare I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Chart content is invalid or its archive is unreadable
    #[error("Invalid chart: {0}")]
    InvalidChart(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StashError {
    /// Wrap an I/O error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn invalid_reference(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn registry(
        registry: impl Into<String>,
        kind: RegistryErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Registry {
            registry: registry.into(),
            kind,
            message: message.into(),
        }
    }

    /// Registry failure kind, if this error came from a registry.
    pub fn registry_kind(&self) -> Option<RegistryErrorKind> {
        match self {
            Self::Registry { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
            || self.registry_kind() == Some(RegistryErrorKind::NotFound)
    }

    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::IoError(_))
    }
}

impl From<serde_json::Error> for StashError {
    fn from(err: serde_json::Error) -> Self {
        StashError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for StashError {
    fn from(err: serde_yaml::Error) -> Self {
        StashError::SerializationError(err.to_string())
    }
}

/// Result type alias for chartstash operations
pub type Result<T> = std::result::Result<T, StashError>;
