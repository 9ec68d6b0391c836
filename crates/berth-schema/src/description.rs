//! The canonical service model every manifest shape normalizes into.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("failed to read description: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid native manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid compose manifest: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("env file '{file}' line {line}: expected KEY=value, got '{content}'")]
    EnvFile {
        file: String,
        line: usize,
        content: String,
    },
    #[error("env file '{0}' is referenced but was not provided")]
    MissingEnvFile(String),
    #[error("container '{container}' references undeclared variable '{name}'")]
    UndeclaredVariable { container: String, name: String },
    #[error("variable '{0}' is declared more than once")]
    DuplicateVariable(String),
    #[error("container '{0}' is declared more than once")]
    DuplicateContainer(String),
    #[error("container '{0}' has neither a prebuilt image nor a build url")]
    MissingImageSource(String),
    #[error("invalid port mapping '{0}', expected '<external>:<internal>'")]
    InvalidPort(String),
    #[error("invalid volume mount '{0}', expected '<volume>:<mountpoint>'")]
    InvalidVolume(String),
}

/// Where a container's image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// Registry reference, always carrying a tag.
    Pull { reference: String },
    /// URL of a `.tar.gz` archive holding exactly one build context directory.
    Build { url: String },
}

impl ImageSource {
    /// Pull source for `name:tag`, defaulting the tag to `latest`.
    pub fn pull(name: &str, tag: Option<&str>) -> Self {
        let tag = tag.filter(|t| !t.is_empty()).unwrap_or("latest");
        Self::Pull {
            reference: format!("{name}:{tag}"),
        }
    }

    /// Pull source parsed from an `image:` string such as `nginx:1.25`.
    pub fn parse_reference(image: &str) -> Self {
        // A colon inside the last path segment is a tag; earlier ones belong to a registry port.
        let last_segment = image.rsplit('/').next().unwrap_or(image);
        match last_segment.rfind(':') {
            Some(pos) => {
                let split = image.len() - last_segment.len() + pos;
                Self::pull(&image[..split], Some(&image[split + 1..]))
            }
            None => Self::pull(image, None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub external: String,
    pub internal: String,
}

impl PortMapping {
    pub fn parse(spec: &str) -> Result<Self, DescriptionError> {
        match spec.split_once(':') {
            Some((ext, int)) if !ext.is_empty() && !int.is_empty() => Ok(Self {
                external: ext.to_owned(),
                internal: int.to_owned(),
            }),
            _ => Err(DescriptionError::InvalidPort(spec.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub name: String,
    /// Run the container in the host network namespace.
    #[serde(default)]
    pub host: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mountpoint: String,
}

impl VolumeMount {
    pub fn parse(spec: &str) -> Result<Self, DescriptionError> {
        let mut parts = spec.splitn(3, ':');
        match (parts.next(), parts.next()) {
            (Some(name), Some(mountpoint)) if !name.is_empty() && !mountpoint.is_empty() => {
                Ok(Self {
                    name: name.to_owned(),
                    mountpoint: mountpoint.to_owned(),
                })
            }
            _ => Err(DescriptionError::InvalidVolume(spec.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub hostname: String,
    pub ports: Vec<PortMapping>,
    /// Ordered; the first entry is the attach point used at creation time.
    pub networks: Vec<NetworkAttachment>,
    pub volumes: Vec<VolumeMount>,
    /// Names of the environment variables handed to the container.
    pub environment: Vec<String>,
    pub image: ImageSource,
    /// Mountpoint for the shared user data directory, if requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdata: Option<String>,
}

impl ContainerSpec {
    pub fn primary_network(&self) -> Option<&NetworkAttachment> {
        self.networks.first()
    }

    /// Networks connected after creation.
    pub fn secondary_networks(&self) -> &[NetworkAttachment] {
        self.networks.get(1..).unwrap_or_default()
    }

    pub fn uses_host_network(&self) -> bool {
        self.primary_network().is_some_and(|n| n.host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(default)]
    pub internal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mutable: bool,
    /// Stored in the service's own variable store instead of the shared one.
    #[serde(default)]
    pub private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub containers: Vec<ContainerSpec>,
    pub networks: Vec<NetworkSpec>,
    pub volumes: Vec<VolumeSpec>,
    pub environment: Vec<EnvDeclaration>,
}

impl ServiceDescription {
    /// Reject descriptions that would make environment resolution ambiguous or partial.
    pub fn validate(&self) -> Result<(), DescriptionError> {
        let mut containers = HashSet::new();
        for c in &self.containers {
            if !containers.insert(c.name.as_str()) {
                return Err(DescriptionError::DuplicateContainer(c.name.clone()));
            }
        }

        let mut declared = HashSet::new();
        for var in &self.environment {
            if !declared.insert(var.name.as_str()) {
                return Err(DescriptionError::DuplicateVariable(var.name.clone()));
            }
        }

        for c in &self.containers {
            if let Some(name) = c.environment.iter().find(|n| !declared.contains(n.as_str())) {
                return Err(DescriptionError::UndeclaredVariable {
                    container: c.name.clone(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }
}
