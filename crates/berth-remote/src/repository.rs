use crate::version::Version;
use crate::RemoteError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Installed by first setup and never removable.
    Essential,
    Plugin,
    #[serde(other)]
    Other,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Essential => "essential",
            ServiceKind::Plugin => "plugin",
            ServiceKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: String,
    pub url: String,
    /// Oldest installed version this release can be updated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<String>,
    /// Whether a service at this version may be reverted to its previous one.
    #[serde(default)]
    pub revert: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub subscription: bool,
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
}

impl Module {
    /// Entries with a parseable version, paired with it. Malformed ones are logged and skipped.
    fn parsed_versions(&self) -> impl Iterator<Item = (Version, &VersionEntry)> {
        self.versions
            .iter()
            .filter_map(|entry| match entry.version.parse::<Version>() {
                Ok(v) => Some((v, entry)),
                Err(e) => {
                    warn!("ignoring repository entry: {e}");
                    None
                }
            })
    }
}

fn requirement_met(name: &str, entry: &VersionEntry, installed: Version) -> bool {
    match entry.required.as_deref() {
        None | Some("") => true,
        Some(req) => match req.parse::<Version>() {
            Ok(req) => req <= installed,
            Err(e) => {
                warn!("ignoring requirement of {name} {}: {e}", entry.version);
                false
            }
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableService {
    pub name: String,
    pub description: String,
    pub subscription: bool,
}

/// The repository's `repository.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryIndex {
    #[serde(default)]
    pub modules: BTreeMap<String, Module>,
}

impl RepositoryIndex {
    pub fn parse(data: &[u8]) -> Result<Self, RemoteError> {
        serde_json::from_slice(data)
            .map_err(|e| RemoteError::Serialization(format!("invalid repository index: {e}")))
    }

    pub fn module(&self, name: &str) -> Result<&Module, RemoteError> {
        self.modules
            .get(name)
            .ok_or_else(|| RemoteError::UnknownService(name.to_owned()))
    }

    pub fn resolve_url(&self, name: &str, version: &str) -> Result<Option<String>, RemoteError> {
        Ok(self
            .module(name)?
            .versions
            .iter()
            .find(|v| v.version == version)
            .map(|v| v.url.clone()))
    }

    /// Highest published version, ignoring update requirements.
    pub fn latest_available(&self, name: &str) -> Result<Option<String>, RemoteError> {
        Ok(self
            .module(name)?
            .parsed_versions()
            .max_by_key(|(v, _)| *v)
            .map(|(_, e)| e.version.clone()))
    }

    /// Highest version not above the latest available whose `required`
    /// version is at most `installed`. Never lower than `installed`.
    pub fn latest_compatible(&self, name: &str, installed: &str) -> Result<String, RemoteError> {
        let installed_v: Version = installed.parse()?;
        let best = self
            .module(name)?
            .parsed_versions()
            .filter(|(v, _)| *v > installed_v)
            .filter(|(_, entry)| requirement_met(name, entry, installed_v))
            .max_by_key(|(v, _)| *v);
        Ok(best.map_or_else(|| installed.to_owned(), |(_, e)| e.version.clone()))
    }

    /// Whether the `revert` flag is set on the entry for `from_version`.
    pub fn is_revert_possible(&self, name: &str, from_version: &str) -> Result<bool, RemoteError> {
        Ok(self
            .module(name)?
            .versions
            .iter()
            .find(|v| v.version == from_version)
            .is_some_and(|v| v.revert))
    }

    pub fn list_available(&self, kind: ServiceKind) -> Vec<AvailableService> {
        self.modules
            .iter()
            .filter(|(_, m)| m.kind == kind)
            .map(|(name, m)| AvailableService {
                name: name.clone(),
                description: m.description.clone(),
                subscription: m.subscription,
            })
            .collect()
    }

    pub fn service_kind(&self, name: &str) -> Result<ServiceKind, RemoteError> {
        Ok(self.module(name)?.kind)
    }
}
