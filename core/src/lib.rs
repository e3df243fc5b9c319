//! chartstash core - shared error taxonomy, configuration and logging.
//!
//! Used by the registry crate and by anything embedding it.

pub mod config;
pub mod error;
pub mod log;

// Re-export commonly used types
pub use config::{StashConfig, TlsConfig, DEFAULT_REGISTRY};
pub use error::{RegistryErrorKind, Result, StashError};
pub use log::{init_logging, LogConfig, LogFormat, LogLevel, OutputSink};

/// chartstash version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
