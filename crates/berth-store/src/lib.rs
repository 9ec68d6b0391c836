//! On-disk state for the berth agent.
//!
//! `StoreLayout` fixes the directory structure, `RecordStore` persists the
//! per-service `config.json`, `EnvStore` holds environment variable values,
//! `AgentRecord` keeps agent-wide identifiers, and the archive helpers back up
//! and restore volume content.

pub mod agent;
pub mod archive;
pub mod envstore;
pub mod layout;
pub mod record;

pub use agent::AgentRecord;
pub use archive::{clear_dir, extract_tar_gz, pack_dir, sole_directory, unpack_into};
pub use envstore::{host_network_address, EnvEntry, EnvStore, HOST_ADDRESS_KEY};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use record::{
    validate_service_name, ContainerRef, ContainerSets, NetworkRef, RecordStore, ServiceRecord,
    ServiceStatus, VolumeRef,
};

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Replace `dest` with `content` via a synced temp file in the same directory.
pub(crate) fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = dest
        .parent()
        .ok_or_else(|| StoreError::Io(std::io::Error::other("destination has no parent")))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for service '{name}': expected {expected}, got {actual}")]
    IntegrityFailure {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid service name: {0}")]
    InvalidName(String),
    #[error("archive error: {0}")]
    Archive(String),
}
