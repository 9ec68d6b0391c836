//! The native JSON manifest (`service_<version>.json`).

use crate::description::{
    ContainerSpec, DescriptionError, EnvDeclaration, ImageSource, NetworkAttachment, NetworkSpec,
    PortMapping, ServiceDescription, VolumeMount, VolumeSpec,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NativeDescription {
    pub containers: Vec<NativeContainer>,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub environment: Vec<EnvDeclaration>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NativeContainer {
    pub name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ports: Vec<NativePort>,
    #[serde(default)]
    pub networks: Vec<NativeNetworkRef>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub prebuilt: Option<Prebuilt>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub userdata: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Prebuilt {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct NativePort {
    pub external: PortValue,
    pub internal: PortValue,
}

/// Ports appear both as numbers and as strings in published manifests.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PortValue {
    Number(u32),
    Text(String),
}

impl std::fmt::Display for PortValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortValue::Number(n) => write!(f, "{n}"),
            PortValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NativeNetworkRef {
    pub name: String,
    /// Any value under `host` selects host networking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<serde_json::Value>,
}

impl NativeDescription {
    pub fn parse(json: &str) -> Result<Self, DescriptionError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn normalize(self) -> Result<ServiceDescription, DescriptionError> {
        let containers = self
            .containers
            .into_iter()
            .map(NativeContainer::normalize)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ServiceDescription {
            containers,
            networks: self.networks,
            volumes: self.volumes,
            environment: self.environment,
        })
    }
}

impl NativeContainer {
    fn normalize(self) -> Result<ContainerSpec, DescriptionError> {
        let image = match (self.prebuilt, self.url) {
            (Some(p), _) => ImageSource::pull(&p.name, p.version.as_deref()),
            (None, Some(url)) => ImageSource::Build { url },
            (None, None) => return Err(DescriptionError::MissingImageSource(self.name)),
        };

        Ok(ContainerSpec {
            hostname: self.hostname.unwrap_or_else(|| self.name.clone()),
            ports: self
                .ports
                .into_iter()
                .map(|p| PortMapping {
                    external: p.external.to_string(),
                    internal: p.internal.to_string(),
                })
                .collect(),
            networks: self
                .networks
                .into_iter()
                .map(|n| NetworkAttachment {
                    name: n.name,
                    host: n.host.is_some(),
                })
                .collect(),
            volumes: self.volumes,
            environment: self.environment,
            image,
            userdata: self.userdata,
            name: self.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "containers": [
            {
                "name": "db",
                "hostname": "database",
                "prebuilt": {"name": "mariadb", "version": "10.6"},
                "ports": [{"external": 3307, "internal": "3306"}],
                "networks": [{"name": "internal"}, {"name": "berth"}],
                "volumes": [{"name": "db_data", "mountpoint": "/var/lib/mysql"}],
                "environment": ["MYSQL_PASSWORD"]
            },
            {
                "name": "web",
                "url": "https://repo.example.org/web.tar.gz",
                "networks": [{"name": "host", "host": true}],
                "userdata": "/srv/userdata"
            }
        ],
        "networks": [{"name": "internal", "internal": true}],
        "volumes": [{"name": "db_data"}],
        "environment": [
            {"name": "MYSQL_PASSWORD", "description": "db password", "mutable": false}
        ]
    }"#;

    #[test]
    fn parses_and_normalizes() {
        let desc = NativeDescription::parse(SAMPLE).unwrap().normalize().unwrap();
        assert_eq!(desc.containers.len(), 2);

        let db = &desc.containers[0];
        assert_eq!(db.hostname, "database");
        assert_eq!(
            db.image,
            ImageSource::Pull {
                reference: "mariadb:10.6".to_owned()
            }
        );
        assert_eq!(db.ports[0].external, "3307");
        assert_eq!(db.ports[0].internal, "3306");
        assert_eq!(db.secondary_networks()[0].name, "berth");

        let web = &desc.containers[1];
        assert_eq!(web.hostname, "web");
        assert!(web.uses_host_network());
        assert_eq!(web.userdata.as_deref(), Some("/srv/userdata"));
        assert!(matches!(web.image, ImageSource::Build { .. }));

        assert!(desc.networks[0].internal);
        assert_eq!(desc.volumes[0].name, "db_data");
        assert!(!desc.environment[0].private);
    }

    #[test]
    fn prebuilt_without_version_uses_latest() {
        let json = r#"{"containers": [{"name": "c", "prebuilt": {"name": "redis"}}]}"#;
        let desc = NativeDescription::parse(json).unwrap().normalize().unwrap();
        assert_eq!(
            desc.containers[0].image,
            ImageSource::Pull {
                reference: "redis:latest".to_owned()
            }
        );
    }

    #[test]
    fn container_without_image_source_fails() {
        let json = r#"{"containers": [{"name": "c"}]}"#;
        let err = NativeDescription::parse(json)
            .unwrap()
            .normalize()
            .unwrap_err();
        assert!(matches!(err, DescriptionError::MissingImageSource(_)));
    }

    #[test]
    fn malformed_json_fails() {
        assert!(NativeDescription::parse("{\"containers\": 3}").is_err());
    }
}
