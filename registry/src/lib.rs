//! chartstash registry - chart cache and OCI registry client.
//!
//! Charts are stored as OCI artifacts: a config blob holding the chart
//! metadata, a tar+gzip content layer and an optional provenance layer.
//! The [`Client`] moves them between a registry and the local [`Cache`].

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod chart;
pub mod client;
pub mod credentials;
pub mod digest;
pub mod getter;
pub mod manifest;
pub mod reference;
pub mod resolver;
pub mod table;
pub mod transport;

// Re-export common types
pub use cache::{Cache, IndexEntry, References};
pub use chart::{Chart, ChartFile, Metadata};
pub use client::{Client, PullStage, PulledChart};
pub use credentials::{CredentialStore, RegistryAuth};
pub use digest::{Algorithm, Digest};
pub use getter::{GetterOptions, OciGetter};
pub use manifest::{Descriptor, LayerKind, Manifest};
pub use reference::Reference;
pub use resolver::{HttpResolver, Resolver};
pub use table::ChartRow;
pub use transport::build_http_client;

/// chartstash registry version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
