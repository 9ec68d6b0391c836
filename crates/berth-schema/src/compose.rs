//! Compose-style manifests (`docker-compose.yml` plus env side-car files).

use crate::description::{
    ContainerSpec, DescriptionError, EnvDeclaration, ImageSource, NetworkAttachment, NetworkSpec,
    PortMapping, ServiceDescription, VolumeMount, VolumeSpec,
};
use crate::envfile::parse_env_file;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ComposeFile {
    #[serde(default)]
    services: Option<Mapping>,
    #[serde(default)]
    networks: Option<Mapping>,
    #[serde(default)]
    volumes: Option<Mapping>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
struct ComposeService {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    ports: Vec<String>,
    #[serde(default)]
    networks: ComposeNetworks,
    #[serde(default)]
    network_mode: Option<String>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    env_file: Option<OneOrMany>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
enum ComposeNetworks {
    List(Vec<String>),
    Map(Mapping),
}

impl Default for ComposeNetworks {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl ComposeNetworks {
    fn names(&self) -> Vec<String> {
        match self {
            Self::List(names) => names.clone(),
            Self::Map(map) => map.keys().filter_map(|k| k.as_str().map(String::from)).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn files(&self) -> Vec<String> {
        let raw = match self {
            Self::One(f) => vec![f.clone()],
            Self::Many(fs) => fs.clone(),
        };
        raw.into_iter()
            .map(|f| f.strip_prefix("./").map(String::from).unwrap_or(f))
            .collect()
    }
}

impl ComposeFile {
    pub fn parse(yaml: &str) -> Result<Self, DescriptionError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Services in declaration order.
    fn services(&self) -> Result<Vec<(String, ComposeService)>, DescriptionError> {
        let Some(services) = &self.services else {
            return Ok(Vec::new());
        };
        services
            .iter()
            .map(|(key, value)| {
                let name = key.as_str().unwrap_or_default().to_owned();
                let service = if value.is_null() {
                    ComposeService::default()
                } else {
                    serde_yaml::from_value(value.clone())?
                };
                Ok((name, service))
            })
            .collect()
    }

    /// Every side-car file referenced by any service, first-seen order, without duplicates.
    pub fn env_file_names(&self) -> Result<Vec<String>, DescriptionError> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for (_, service) in self.services()? {
            for file in service.env_file.iter().flat_map(OneOrMany::files) {
                if seen.insert(file.clone()) {
                    names.push(file);
                }
            }
        }
        Ok(names)
    }
}

/// Replace the last path segment of `url` with `file`.
pub fn sibling_url(url: &str, file: &str) -> String {
    match url.rfind('/') {
        Some(idx) => format!("{}/{file}", &url[..idx]),
        None => file.to_owned(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComposeDescription {
    pub file: ComposeFile,
    /// Side-car file contents keyed by the name used in `env_file`.
    pub env_files: BTreeMap<String, String>,
    /// URL the compose file was downloaded from; build archives live next to it.
    pub source_url: String,
}

impl ComposeDescription {
    pub fn new(file: ComposeFile, env_files: BTreeMap<String, String>, source_url: &str) -> Self {
        Self {
            file,
            env_files,
            source_url: source_url.to_owned(),
        }
    }

    fn declarations(&self, file: &str) -> Result<Vec<EnvDeclaration>, DescriptionError> {
        let content = self
            .env_files
            .get(file)
            .ok_or_else(|| DescriptionError::MissingEnvFile(file.to_owned()))?;
        parse_env_file(file, content)
    }

    pub fn normalize(self) -> Result<ServiceDescription, DescriptionError> {
        let mut containers = Vec::new();
        let mut environment: Vec<EnvDeclaration> = Vec::new();
        let mut seen = HashSet::new();

        for (name, service) in self.file.services()? {
            let mut env_names = Vec::new();
            for file in service.env_file.iter().flat_map(OneOrMany::files) {
                for decl in self.declarations(&file)? {
                    if !env_names.contains(&decl.name) {
                        env_names.push(decl.name.clone());
                    }
                    if seen.insert(decl.name.clone()) {
                        environment.push(decl);
                    }
                }
            }

            let image = match service.image.as_deref() {
                Some(image) => ImageSource::parse_reference(image),
                None => ImageSource::Build {
                    url: sibling_url(&self.source_url, &format!("{name}.tar.gz")),
                },
            };

            let mut networks: Vec<NetworkAttachment> = service
                .networks
                .names()
                .into_iter()
                .map(|n| NetworkAttachment {
                    name: n,
                    host: false,
                })
                .collect();
            if service.network_mode.as_deref() == Some("host") {
                networks.insert(
                    0,
                    NetworkAttachment {
                        name: "host".to_owned(),
                        host: true,
                    },
                );
            }

            containers.push(ContainerSpec {
                hostname: service.hostname.unwrap_or_else(|| name.clone()),
                ports: service
                    .ports
                    .iter()
                    .map(|p| PortMapping::parse(p))
                    .collect::<Result<_, _>>()?,
                networks,
                volumes: service
                    .volumes
                    .iter()
                    .map(|v| VolumeMount::parse(v))
                    .collect::<Result<_, _>>()?,
                environment: env_names,
                image,
                userdata: None,
                name,
            });
        }

        let networks = self
            .file
            .networks
            .iter()
            .flatten()
            .filter_map(|(k, v)| {
                k.as_str().map(|name| NetworkSpec {
                    name: name.to_owned(),
                    internal: has_key(v, "internal"),
                })
            })
            .collect();

        let volumes = self
            .file
            .volumes
            .iter()
            .flatten()
            .filter_map(|(k, _)| {
                k.as_str().map(|name| VolumeSpec {
                    name: name.to_owned(),
                })
            })
            .collect();

        Ok(ServiceDescription {
            containers,
            networks,
            volumes,
            environment,
        })
    }
}

fn has_key(value: &Value, key: &str) -> bool {
    value.as_mapping().is_some_and(|m| m.contains_key(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPOSE: &str = r"
services:
  db:
    image: mariadb:10.6
    ports:
      - '3307:3306'
    networks:
      - internal
    volumes:
      - db_data:/var/lib/mysql
    env_file: ./settings.env
  web:
    networks:
      - internal
      - berth
    env_file:
      - ./settings.env
      - web.env
networks:
  internal:
    internal: true
  public:
volumes:
  db_data:
";

    fn env_files() -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        files.insert(
            "settings.env".to_owned(),
            "# Database password\nDB_PASS=\n# Database name U\nDB_NAME=school\n".to_owned(),
        );
        files.insert(
            "web.env".to_owned(),
            "# Database name\nDB_NAME=other\n# Site title M\nTITLE=\n".to_owned(),
        );
        files
    }

    fn normalized() -> ServiceDescription {
        let file = ComposeFile::parse(COMPOSE).unwrap();
        ComposeDescription::new(
            file,
            env_files(),
            "https://repo.example.org/school/1.0.0/docker-compose.yml",
        )
        .normalize()
        .unwrap()
    }

    #[test]
    fn translates_services_in_order() {
        let desc = normalized();
        let names: Vec<_> = desc.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["db", "web"]);

        let db = &desc.containers[0];
        assert_eq!(
            db.image,
            ImageSource::Pull {
                reference: "mariadb:10.6".to_owned()
            }
        );
        assert_eq!(db.ports[0].external, "3307");
        assert_eq!(db.volumes[0].mountpoint, "/var/lib/mysql");
        assert_eq!(db.hostname, "db");
    }

    #[test]
    fn service_without_image_builds_from_sibling_archive() {
        let desc = normalized();
        assert_eq!(
            desc.containers[1].image,
            ImageSource::Build {
                url: "https://repo.example.org/school/1.0.0/web.tar.gz".to_owned()
            }
        );
        assert_eq!(desc.containers[1].networks[1].name, "berth");
    }

    #[test]
    fn environment_is_deduplicated_first_seen() {
        let desc = normalized();
        let names: Vec<_> = desc.environment.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["DB_PASS", "DB_NAME", "TITLE"]);
        // first declaration wins
        assert_eq!(desc.environment[1].default.as_deref(), Some("school"));
        assert_eq!(desc.containers[1].environment, vec!["DB_PASS", "DB_NAME", "TITLE"]);
    }

    #[test]
    fn networks_and_volumes_translated() {
        let desc = normalized();
        assert_eq!(desc.networks.len(), 2);
        assert!(desc.networks[0].internal);
        assert!(!desc.networks[1].internal);
        assert_eq!(desc.volumes[0].name, "db_data");
    }

    #[test]
    fn env_file_names_are_normalized() {
        let file = ComposeFile::parse(COMPOSE).unwrap();
        assert_eq!(file.env_file_names().unwrap(), vec!["settings.env", "web.env"]);
    }

    #[test]
    fn missing_side_car_fails() {
        let file = ComposeFile::parse(COMPOSE).unwrap();
        let err = ComposeDescription::new(file, BTreeMap::new(), "x/docker-compose.yml")
            .normalize()
            .unwrap_err();
        assert!(matches!(err, DescriptionError::MissingEnvFile(_)));
    }

    #[test]
    fn host_network_mode() {
        let yaml = "services:\n  probe:\n    image: busybox\n    network_mode: host\n";
        let desc = ComposeDescription::new(ComposeFile::parse(yaml).unwrap(), BTreeMap::new(), "")
            .normalize()
            .unwrap();
        assert!(desc.containers[0].uses_host_network());
    }

    #[test]
    fn sibling_url_replaces_last_segment() {
        assert_eq!(
            sibling_url("https://a/b/docker-compose.yml", "x.env"),
            "https://a/b/x.env"
        );
        assert_eq!(sibling_url("plain", "x.env"), "x.env");
    }
}
