//! Durable key/value store for service environment variables.
//!
//! One store lives at the state root and is shared by all services; each
//! service may also carry a private one in its own directory. Every mutation
//! is a read-modify-write under the store mutex followed by an atomic file
//! replace, so concurrent writers never lose each other's updates.

use crate::{write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Variable describing the host's primary network address.
pub const HOST_ADDRESS_KEY: &str = "HOST_NETWORK_ADDRESS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvEntry {
    pub value: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_mutable")]
    pub mutable: bool,
}

fn default_mutable() -> bool {
    true
}

#[derive(Debug)]
pub struct EnvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, EnvEntry>>,
}

impl EnvStore {
    /// Load the store at `path`. A missing file yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, EnvEntry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|e| StoreError::LockFailed(format!("env store mutex poisoned: {e}")))
    }

    fn flush(&self, entries: &BTreeMap<String, EnvEntry>) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(entries)?;
        write_atomic(&self.path, content.as_bytes())
    }

    pub fn contains(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.contains_key(name))
    }

    pub fn value(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(name).map(|e| e.value.clone()))
    }

    pub fn entry(&self, name: &str) -> Result<Option<EnvEntry>, StoreError> {
        Ok(self.lock()?.get(name).cloned())
    }

    /// Snapshot of every entry, ordered by name.
    pub fn entries(&self) -> Result<BTreeMap<String, EnvEntry>, StoreError> {
        Ok(self.lock()?.clone())
    }

    /// Insert or overwrite `name`, then persist.
    pub fn store_value(
        &self,
        name: &str,
        value: &str,
        description: &str,
        mutable: bool,
    ) -> Result<(), StoreError> {
        let mut entries = self.lock()?;
        entries.insert(
            name.to_owned(),
            EnvEntry {
                value: value.to_owned(),
                description: description.to_owned(),
                mutable,
            },
        );
        self.flush(&entries)
    }

    /// Store `name` only when it has no value yet. Returns whether it was written.
    pub fn store_if_absent(
        &self,
        name: &str,
        value: &str,
        description: &str,
        mutable: bool,
    ) -> Result<bool, StoreError> {
        let mut entries = self.lock()?;
        if entries.contains_key(name) {
            return Ok(false);
        }
        entries.insert(
            name.to_owned(),
            EnvEntry {
                value: value.to_owned(),
                description: description.to_owned(),
                mutable,
            },
        );
        self.flush(&entries)?;
        Ok(true)
    }

    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let mut entries = self.lock()?;
        if entries.remove(name).is_none() {
            return Ok(false);
        }
        self.flush(&entries)?;
        Ok(true)
    }

    /// Overwrite [`HOST_ADDRESS_KEY`] with the currently detected address.
    pub fn refresh_host_address(&self) -> Result<String, StoreError> {
        let address = host_network_address();
        self.store_value(
            HOST_ADDRESS_KEY,
            &address,
            "Primary network address of the host",
            false,
        )?;
        Ok(address)
    }
}

/// Address of the interface carrying the default route, or `127.0.0.1`.
///
/// Connecting a UDP socket sends no packets; it only asks the kernel to pick
/// a source address.
pub fn host_network_address() -> String {
    let detect = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("10.255.255.255:1")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    match detect() {
        Ok(addr) if addr != "0.0.0.0" => addr,
        _ => "127.0.0.1".to_owned(),
    }
}
