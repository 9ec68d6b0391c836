//! Service repository access for berth.
//!
//! The repository publishes one JSON index listing every service, its kind,
//! and the manifest URL of each released version. [`ManifestClient`] caches
//! that index for a fixed time and answers version queries against it;
//! manifests, env side-car files, and build archives are fetched through the
//! same [`Transport`].

pub mod client;
pub mod config;
pub mod http;
pub mod repository;
pub mod version;

pub use client::ManifestClient;
pub use config::RemoteConfig;
pub use http::{HttpTransport, StaticTransport, Transport};
pub use repository::{AvailableService, Module, RepositoryIndex, ServiceKind, VersionEntry};
pub use version::{compare_versions, Version};

/// Sent as `User-Agent` on every HTTP request.
pub const USER_AGENT: &str = concat!("berth/", env!("CARGO_PKG_VERSION"));

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("remote config error: {0}")]
    Config(String),
    #[error("invalid version string: '{0}'")]
    InvalidVersion(String),
    #[error("service '{0}' is not listed in the repository")]
    UnknownService(String),
}
