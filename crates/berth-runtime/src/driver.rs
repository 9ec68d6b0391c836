use crate::RuntimeError;
use berth_schema::{ContainerId, ImageId, NetworkId, PortMapping, VolumeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Network a container is attached to at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    /// The engine's default bridge.
    Default,
    /// Share the host's network stack.
    Host,
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountSource {
    Volume(String),
    Bind(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: MountSource,
    pub target: String,
}

/// Everything needed to create (not start) one container.
///
/// Containers are always created with an on-failure restart policy capped at
/// [`ContainerCreate::RESTART_RETRIES`] attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerCreate {
    pub name: String,
    pub hostname: String,
    pub image: ImageId,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    pub network: NetworkMode,
}

impl ContainerCreate {
    pub const RESTART_RETRIES: u32 = 5;
}

/// Capability surface over a container engine.
///
/// Every call distinguishes a missing object ([`RuntimeError::NotFound`]) from
/// an engine rejection ([`RuntimeError::Engine`]); image builds fail with
/// [`RuntimeError::Build`].
pub trait RuntimeDriver: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    fn create_container(&self, spec: &ContainerCreate) -> Result<ContainerId, RuntimeError>;

    fn start_container(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    fn stop_container(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    fn remove_container(&self, id: &ContainerId, purge_volumes: bool) -> Result<(), RuntimeError>;

    fn rename_container(&self, id: &ContainerId, new_name: &str) -> Result<(), RuntimeError>;

    fn container_running(&self, id: &ContainerId) -> Result<bool, RuntimeError>;

    fn pull_image(&self, reference: &str) -> Result<ImageId, RuntimeError>;

    /// Build the image from a context directory holding a Dockerfile.
    fn build_image(&self, context: &Path, tag: &str) -> Result<ImageId, RuntimeError>;

    fn remove_image(&self, image: &ImageId) -> Result<(), RuntimeError>;

    fn prune_networks(&self) -> Result<(), RuntimeError>;

    fn prune_images(&self) -> Result<(), RuntimeError>;

    fn prune_volumes(&self) -> Result<(), RuntimeError>;

    fn create_network(&self, name: &str, internal: bool) -> Result<NetworkId, RuntimeError>;

    fn find_network(&self, name: &str) -> Result<Option<NetworkId>, RuntimeError>;

    fn connect_network(
        &self,
        network: &NetworkId,
        container: &ContainerId,
        aliases: &[String],
    ) -> Result<(), RuntimeError>;

    fn create_volume(&self, name: &str) -> Result<VolumeId, RuntimeError>;

    fn remove_volume(&self, id: &VolumeId) -> Result<(), RuntimeError>;

    /// Host directory holding the volume's data.
    fn volume_path(&self, id: &VolumeId) -> Result<PathBuf, RuntimeError>;
}

pub fn select_driver(
    name: &str,
    store_root: &Path,
) -> Result<Arc<dyn RuntimeDriver>, RuntimeError> {
    match name {
        "docker" => Ok(Arc::new(crate::docker::DockerDriver::new())),
        "mock" => Ok(Arc::new(crate::mock::MockDriver::with_root(
            store_root.join("mock-engine"),
        ))),
        other => Err(RuntimeError::DriverUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_drivers() {
        let dir = std::env::temp_dir();
        assert_eq!(select_driver("docker", &dir).unwrap().name(), "docker");
        assert_eq!(select_driver("mock", &dir).unwrap().name(), "mock");
    }

    #[test]
    fn select_invalid_driver_fails() {
        assert!(matches!(
            select_driver("podman", Path::new("/tmp")),
            Err(RuntimeError::DriverUnavailable(_))
        ));
    }
}
