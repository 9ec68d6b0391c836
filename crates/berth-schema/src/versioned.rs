use crate::compose::{ComposeDescription, ComposeFile};
use crate::description::{
    ContainerSpec, DescriptionError, EnvDeclaration, ImageSource, NetworkSpec, ServiceDescription,
    VolumeSpec,
};
use crate::native::NativeDescription;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Written next to the downloaded files of each version.
pub const ORIGIN_FILE: &str = "origin.json";
pub const COMPOSE_FILE: &str = "docker-compose.yml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestFormat {
    Native,
    Compose,
}

impl ManifestFormat {
    pub fn from_url(url: &str) -> Self {
        if url.ends_with(".json") {
            Self::Native
        } else {
            Self::Compose
        }
    }

    pub fn file_name(self, version: &str) -> String {
        match self {
            Self::Native => format!("service_{version}.json"),
            Self::Compose => COMPOSE_FILE.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestOrigin {
    pub url: String,
    pub format: ManifestFormat,
}

/// One of the two supported manifest shapes before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawDescription {
    Native(NativeDescription),
    Compose(ComposeDescription),
}

impl RawDescription {
    pub fn normalize(self) -> Result<ServiceDescription, DescriptionError> {
        match self {
            RawDescription::Native(n) => n.normalize(),
            RawDescription::Compose(c) => c.normalize(),
        }
    }
}

/// A parsed, validated description of one service version. Never mutated after load.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedDescription {
    version: String,
    origin: ManifestOrigin,
    model: ServiceDescription,
}

impl VersionedDescription {
    pub fn from_raw(
        version: &str,
        origin: ManifestOrigin,
        raw: RawDescription,
    ) -> Result<Self, DescriptionError> {
        let model = raw.normalize()?;
        model.validate()?;
        Ok(Self {
            version: version.to_owned(),
            origin,
            model,
        })
    }

    pub fn parse_native(version: &str, url: &str, json: &str) -> Result<Self, DescriptionError> {
        let origin = ManifestOrigin {
            url: url.to_owned(),
            format: ManifestFormat::Native,
        };
        Self::from_raw(
            version,
            origin,
            RawDescription::Native(NativeDescription::parse(json)?),
        )
    }

    pub fn parse_compose(
        version: &str,
        url: &str,
        yaml: &str,
        env_files: BTreeMap<String, String>,
    ) -> Result<Self, DescriptionError> {
        let origin = ManifestOrigin {
            url: url.to_owned(),
            format: ManifestFormat::Compose,
        };
        let compose = ComposeDescription::new(ComposeFile::parse(yaml)?, env_files, url);
        Self::from_raw(version, origin, RawDescription::Compose(compose))
    }

    /// Write the downloaded files of one version into `dir`.
    pub fn persist_files(
        dir: &Path,
        version: &str,
        origin: &ManifestOrigin,
        manifest: &str,
        env_files: &BTreeMap<String, String>,
    ) -> Result<(), DescriptionError> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(origin.format.file_name(version)), manifest)?;
        for (name, content) in env_files {
            fs::write(dir.join(name), content)?;
        }
        fs::write(dir.join(ORIGIN_FILE), serde_json::to_vec_pretty(origin)?)?;
        Ok(())
    }

    /// Load a version previously written by [`persist_files`](Self::persist_files).
    pub fn load(dir: &Path, version: &str) -> Result<Self, DescriptionError> {
        let origin: ManifestOrigin = serde_json::from_slice(&fs::read(dir.join(ORIGIN_FILE))?)?;
        let manifest = fs::read_to_string(dir.join(origin.format.file_name(version)))?;
        match origin.format {
            ManifestFormat::Native => Self::parse_native(version, &origin.url, &manifest),
            ManifestFormat::Compose => {
                let file = ComposeFile::parse(&manifest)?;
                let mut env_files = BTreeMap::new();
                for name in file.env_file_names()? {
                    let path = dir.join(&name);
                    if path.exists() {
                        env_files.insert(name, fs::read_to_string(path)?);
                    }
                }
                let compose = ComposeDescription::new(file, env_files, &origin.url);
                Self::from_raw(version, origin, RawDescription::Compose(compose))
            }
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn format(&self) -> ManifestFormat {
        self.origin.format
    }

    pub fn source_url(&self) -> &str {
        &self.origin.url
    }

    pub fn description(&self) -> &ServiceDescription {
        &self.model
    }

    pub fn containers(&self) -> &[ContainerSpec] {
        &self.model.containers
    }

    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.model.containers.iter().find(|c| c.name == name)
    }

    pub fn container_count(&self) -> usize {
        self.model.containers.len()
    }

    pub fn networks(&self) -> &[NetworkSpec] {
        &self.model.networks
    }

    pub fn volumes(&self) -> &[VolumeSpec] {
        &self.model.volumes
    }

    /// Every declared variable, in first-seen order.
    pub fn environment(&self) -> &[EnvDeclaration] {
        &self.model.environment
    }

    pub fn declaration(&self, name: &str) -> Option<&EnvDeclaration> {
        self.model.environment.iter().find(|e| e.name == name)
    }

    pub fn image_source(&self, container: &str) -> Option<&ImageSource> {
        self.container(container).map(|c| &c.image)
    }
}
