use crate::driver::{ContainerCreate, MountSource, NetworkMode, RuntimeDriver};
use crate::RuntimeError;
use berth_schema::{ContainerId, ImageId, NetworkId, VolumeId};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Driver backed by the `docker` command-line client.
pub struct DockerDriver {
    binary: String,
}

impl Default for DockerDriver {
    fn default() -> Self {
        Self {
            binary: "docker".to_owned(),
        }
    }
}

impl DockerDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different client binary, e.g. a wrapper script.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String, RuntimeError> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        debug!("{} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary).args(&args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::DriverUnavailable(self.binary.clone())
            } else {
                RuntimeError::Io(e)
            }
        })?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        Err(classify_failure(args.first().copied().unwrap_or(""), &stderr))
    }
}

fn classify_failure(command: &str, stderr: &str) -> RuntimeError {
    let lower = stderr.to_ascii_lowercase();
    if command == "build" {
        RuntimeError::Build(stderr.to_owned())
    } else if lower.contains("no such") || lower.contains("not found") {
        RuntimeError::NotFound(stderr.to_owned())
    } else {
        RuntimeError::Engine(stderr.to_owned())
    }
}

/// Arguments of `docker create` for `spec`.
fn create_args(spec: &ContainerCreate) -> Vec<String> {
    let mut args = vec![
        "create".to_owned(),
        "--name".to_owned(),
        spec.name.clone(),
        "--restart".to_owned(),
        format!("on-failure:{}", ContainerCreate::RESTART_RETRIES),
    ];
    if !spec.hostname.is_empty() && spec.network != NetworkMode::Host {
        args.push("--hostname".to_owned());
        args.push(spec.hostname.clone());
    }
    for port in &spec.ports {
        args.push("--publish".to_owned());
        args.push(format!("{}:{}", port.external, port.internal));
    }
    for mount in &spec.mounts {
        let source = match &mount.source {
            MountSource::Volume(name) => name.clone(),
            MountSource::Bind(path) => path.display().to_string(),
        };
        args.push("--volume".to_owned());
        args.push(format!("{source}:{}", mount.target));
    }
    for (key, value) in &spec.env {
        args.push("--env".to_owned());
        args.push(format!("{key}={value}"));
    }
    match &spec.network {
        NetworkMode::Default => {}
        NetworkMode::Host => {
            args.push("--network".to_owned());
            args.push("host".to_owned());
        }
        NetworkMode::Named(name) => {
            args.push("--network".to_owned());
            args.push(name.clone());
        }
    }
    args.push(spec.image.as_str().to_owned());
    args
}

impl RuntimeDriver for DockerDriver {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn available(&self) -> bool {
        self.run(&["version", "--format", "{{.Server.Version}}"]).is_ok()
    }

    fn create_container(&self, spec: &ContainerCreate) -> Result<ContainerId, RuntimeError> {
        Ok(ContainerId::new(self.run(&create_args(spec))?))
    }

    fn start_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.run(&["start", id.as_str()]).map(drop)
    }

    fn stop_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.run(&["stop", id.as_str()]).map(drop)
    }

    fn remove_container(&self, id: &ContainerId, purge_volumes: bool) -> Result<(), RuntimeError> {
        let mut args = vec!["rm", "--force"];
        if purge_volumes {
            args.push("--volumes");
        }
        args.push(id.as_str());
        self.run(&args).map(drop)
    }

    fn rename_container(&self, id: &ContainerId, new_name: &str) -> Result<(), RuntimeError> {
        self.run(&["rename", id.as_str(), new_name]).map(drop)
    }

    fn container_running(&self, id: &ContainerId) -> Result<bool, RuntimeError> {
        let state = self.run(&["inspect", "--format", "{{.State.Running}}", id.as_str()])?;
        Ok(state == "true")
    }

    fn pull_image(&self, reference: &str) -> Result<ImageId, RuntimeError> {
        self.run(&["pull", "--quiet", reference])?;
        let id = self.run(&["image", "inspect", "--format", "{{.Id}}", reference])?;
        Ok(ImageId::new(id))
    }

    fn build_image(&self, context: &Path, tag: &str) -> Result<ImageId, RuntimeError> {
        let context = context.display().to_string();
        let id = self.run(&["build", "--quiet", "--rm", "--tag", tag, &context])?;
        Ok(ImageId::new(id))
    }

    fn remove_image(&self, image: &ImageId) -> Result<(), RuntimeError> {
        self.run(&["rmi", image.as_str()]).map(drop)
    }

    fn prune_networks(&self) -> Result<(), RuntimeError> {
        self.run(&["network", "prune", "--force"]).map(drop)
    }

    fn prune_images(&self) -> Result<(), RuntimeError> {
        self.run(&["image", "prune", "--force"]).map(drop)
    }

    fn prune_volumes(&self) -> Result<(), RuntimeError> {
        self.run(&["volume", "prune", "--force"]).map(drop)
    }

    fn create_network(&self, name: &str, internal: bool) -> Result<NetworkId, RuntimeError> {
        let mut args = vec!["network", "create", "--driver", "bridge"];
        if internal {
            args.push("--internal");
        }
        args.push(name);
        Ok(NetworkId::new(self.run(&args)?))
    }

    fn find_network(&self, name: &str) -> Result<Option<NetworkId>, RuntimeError> {
        match self.run(&["network", "inspect", "--format", "{{.Id}}", name]) {
            Ok(id) => Ok(Some(NetworkId::new(id))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn connect_network(
        &self,
        network: &NetworkId,
        container: &ContainerId,
        aliases: &[String],
    ) -> Result<(), RuntimeError> {
        let mut args = vec!["network".to_owned(), "connect".to_owned()];
        for alias in aliases {
            args.push("--alias".to_owned());
            args.push(alias.clone());
        }
        args.push(network.as_str().to_owned());
        args.push(container.as_str().to_owned());
        self.run(&args).map(drop)
    }

    fn create_volume(&self, name: &str) -> Result<VolumeId, RuntimeError> {
        // Local volumes are addressed by name.
        let created = self.run(&["volume", "create", "--driver", "local", name])?;
        Ok(VolumeId::new(created))
    }

    fn remove_volume(&self, id: &VolumeId) -> Result<(), RuntimeError> {
        self.run(&["volume", "rm", id.as_str()]).map(drop)
    }

    fn volume_path(&self, id: &VolumeId) -> Result<PathBuf, RuntimeError> {
        let path = self.run(&["volume", "inspect", "--format", "{{.Mountpoint}}", id.as_str()])?;
        Ok(PathBuf::from(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Mount;
    use berth_schema::PortMapping;
    use std::collections::BTreeMap;

    fn sample_spec(network: NetworkMode) -> ContainerCreate {
        ContainerCreate {
            name: "wiki_db".to_owned(),
            hostname: "db".to_owned(),
            image: ImageId::new("sha256:abc"),
            ports: vec![PortMapping {
                external: "3306".to_owned(),
                internal: "3306".to_owned(),
            }],
            mounts: vec![
                Mount {
                    source: MountSource::Volume("wiki_data".to_owned()),
                    target: "/var/lib/mysql".to_owned(),
                },
                Mount {
                    source: MountSource::Bind(PathBuf::from("/srv/userdata")),
                    target: "/userdata".to_owned(),
                },
            ],
            env: BTreeMap::from([("MYSQL_USER".to_owned(), "berth".to_owned())]),
            network,
        }
    }

    #[test]
    fn create_args_cover_every_field() {
        let args = create_args(&sample_spec(NetworkMode::Named("wiki_net".to_owned())));
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name wiki_db --restart on-failure:5"));
        assert!(joined.contains("--hostname db"));
        assert!(joined.contains("--publish 3306:3306"));
        assert!(joined.contains("--volume wiki_data:/var/lib/mysql"));
        assert!(joined.contains("--volume /srv/userdata:/userdata"));
        assert!(joined.contains("--env MYSQL_USER=berth"));
        assert!(joined.contains("--network wiki_net"));
        assert_eq!(args.last().map(String::as_str), Some("sha256:abc"));
    }

    #[test]
    fn host_network_skips_hostname() {
        let args = create_args(&sample_spec(NetworkMode::Host));
        assert!(!args.contains(&"--hostname".to_owned()));
        assert!(args.join(" ").contains("--network host"));
    }

    #[test]
    fn failures_are_classified() {
        assert!(classify_failure("start", "Error: No such container: abc").is_not_found());
        assert!(matches!(
            classify_failure("build", "The command '/bin/sh -c make' returned a non-zero code: 2"),
            RuntimeError::Build(_)
        ));
        assert!(matches!(
            classify_failure("create", "Conflict. The container name is already in use"),
            RuntimeError::Engine(_)
        ));
    }

    #[test]
    fn build_output_mentioning_not_found_is_a_build_error() {
        assert!(matches!(
            classify_failure("build", "/bin/sh: 1: make: not found"),
            RuntimeError::Build(_)
        ));
        assert!(classify_failure("rm", "Error response from daemon: image not found").is_not_found());
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let driver = DockerDriver::with_binary("/nonexistent/docker-client");
        assert!(!driver.available());
        assert!(matches!(
            driver.start_container(&ContainerId::new("abc")),
            Err(RuntimeError::DriverUnavailable(_))
        ));
    }
}
