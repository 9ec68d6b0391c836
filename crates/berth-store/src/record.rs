use crate::layout::StoreLayout;
use crate::{write_atomic, StoreError};
use berth_schema::{ContainerId, ImageId, NetworkId, VolumeId};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ServiceStatus {
    Empty,
    Preparing,
    InstallPending,
    Installing,
    Paused,
    Running,
    UpdatePending,
    Updating,
    Reverting,
    Deleting,
    Deleted,
    Undefined,
    Builderror,
    Inaccessible,
    Error,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Empty => "empty",
            ServiceStatus::Preparing => "preparing",
            ServiceStatus::InstallPending => "installPending",
            ServiceStatus::Installing => "installing",
            ServiceStatus::Paused => "paused",
            ServiceStatus::Running => "running",
            ServiceStatus::UpdatePending => "updatePending",
            ServiceStatus::Updating => "updating",
            ServiceStatus::Reverting => "reverting",
            ServiceStatus::Deleting => "deleting",
            ServiceStatus::Deleted => "deleted",
            ServiceStatus::Undefined => "undefined",
            ServiceStatus::Builderror => "builderror",
            ServiceStatus::Inaccessible => "inaccessible",
            ServiceStatus::Error => "error",
        }
    }

    /// A lifecycle operation is in flight.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            ServiceStatus::Preparing
                | ServiceStatus::Installing
                | ServiceStatus::Updating
                | ServiceStatus::Reverting
                | ServiceStatus::Deleting
        )
    }

    /// Waiting for operator input before the operation may continue.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ServiceStatus::InstallPending | ServiceStatus::UpdatePending
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ServiceStatus::Undefined
                | ServiceStatus::Builderror
                | ServiceStatus::Inaccessible
                | ServiceStatus::Error
        )
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ContainerRef {
    pub name: String,
    pub id: ContainerId,
    pub image: ImageId,
}

impl ContainerRef {
    /// Name a container carries while it belongs to the previous version.
    pub fn retired_name(name: &str, version: &str) -> String {
        format!("{name}_{version}")
    }

    /// Inverse of [`retired_name`](Self::retired_name); unchanged if the suffix is absent.
    pub fn original_name<'a>(name: &'a str, version: &str) -> &'a str {
        name.strip_suffix(version)
            .and_then(|rest| rest.strip_suffix('_'))
            .unwrap_or(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkRef {
    pub id: NetworkId,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeRef {
    pub id: VolumeId,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSets {
    #[serde(default)]
    pub actual: Vec<ContainerRef>,
    #[serde(default)]
    pub previous: Vec<ContainerRef>,
}

/// Durable mirror of one service's mutable state (`config.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    #[serde(default)]
    pub networks: Vec<NetworkRef>,
    #[serde(default)]
    pub volumes: Vec<VolumeRef>,
    #[serde(default)]
    pub containers: ContainerSets,
    pub wanted: bool,
    pub status: ServiceStatus,
    #[serde(default)]
    pub actual_version: String,
    #[serde(default)]
    pub previous_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// blake3 over the record without this field. `None` for hand-written records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self {
            networks: Vec::new(),
            volumes: Vec::new(),
            containers: ContainerSets::default(),
            wanted: true,
            status: ServiceStatus::Empty,
            actual_version: String::new(),
            previous_version: String::new(),
            updated_at: None,
            checksum: None,
        }
    }
}

impl ServiceRecord {
    pub fn has_previous(&self) -> bool {
        !self.previous_version.is_empty()
    }

    /// Move every actual container into `previous`, renamed with the previous version suffix.
    pub fn retire_actual(&mut self) {
        let version = self.previous_version.clone();
        self.containers.previous = self
            .containers
            .actual
            .drain(..)
            .map(|c| ContainerRef {
                name: ContainerRef::retired_name(&c.name, &version),
                ..c
            })
            .collect();
    }

    /// Move the previous containers back into `actual` under their original names.
    pub fn reinstate_previous(&mut self) {
        let version = self.previous_version.clone();
        self.containers.actual = self
            .containers
            .previous
            .drain(..)
            .map(|c| ContainerRef {
                name: ContainerRef::original_name(&c.name, &version).to_owned(),
                ..c
            })
            .collect();
    }

    pub fn network(&self, name: &str) -> Option<&NetworkRef> {
        self.networks.iter().find(|n| n.name == name)
    }

    pub fn volume(&self, name: &str) -> Option<&VolumeRef> {
        self.volumes.iter().find(|v| v.name == name)
    }

    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = to_sorted_json(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// Pretty JSON with lexicographically ordered keys and four-space indent.
fn to_sorted_json(record: &ServiceRecord) -> Result<String, StoreError> {
    // serde_json::Value keeps object keys in a BTreeMap.
    let value = serde_json::to_value(record)?;
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    String::from_utf8(buf).map_err(|e| StoreError::Io(std::io::Error::other(e)))
}

pub fn validate_service_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.len() > 64 {
        return Err(StoreError::InvalidName(
            "service name must be 1-64 characters".to_owned(),
        ));
    }
    if name.starts_with('.')
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
    {
        return Err(StoreError::InvalidName(format!(
            "'{name}' must match [a-zA-Z0-9_.-] and not start with '.'"
        )));
    }
    Ok(())
}

pub struct RecordStore {
    layout: StoreLayout,
}

impl RecordStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn put(&self, name: &str, record: &ServiceRecord) -> Result<(), StoreError> {
        validate_service_name(name)?;
        let mut stamped = record.clone();
        stamped.updated_at = Some(chrono::Utc::now().to_rfc3339());
        stamped.checksum = Some(stamped.compute_checksum()?);
        let content = to_sorted_json(&stamped)?;
        write_atomic(&self.layout.service_config(name), content.as_bytes())
    }

    pub fn get(&self, name: &str) -> Result<ServiceRecord, StoreError> {
        validate_service_name(name)?;
        let path = self.layout.service_config(name);
        if !path.exists() {
            return Err(StoreError::ServiceNotFound(name.to_owned()));
        }
        let record: ServiceRecord = serde_json::from_str(&fs::read_to_string(&path)?)?;

        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    name: name.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(record)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.layout.service_config(name).exists()
    }

    /// Names of all service directories holding a record, sorted.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.layout.services_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if validate_service_name(&name).is_err() {
                continue;
            }
            if self.exists(&name) {
                names.push(name);
            } else {
                tracing::warn!("skipping service directory '{name}' without config.json");
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove the whole service directory.
    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        validate_service_name(name)?;
        let dir = self.layout.service_dir(name);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}
