use crate::driver::{ContainerCreate, Mount, MountSource, NetworkMode, RuntimeDriver};
use crate::RuntimeError;
use berth_schema::{ContainerId, ImageId, NetworkId, VolumeId};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockContainer {
    pub name: String,
    pub image: ImageId,
    pub running: bool,
    pub network: NetworkMode,
    pub connected: Vec<NetworkId>,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockNetwork {
    pub name: String,
    pub internal: bool,
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<ContainerId, MockContainer>,
    images: BTreeMap<ImageId, String>,
    networks: BTreeMap<NetworkId, MockNetwork>,
    volumes: BTreeMap<VolumeId, String>,
    calls: Vec<String>,
    failing_pulls: HashSet<String>,
    failing_builds: Vec<String>,
    seq: u64,
}

impl MockState {
    fn next_id(&mut self, kind: &str, name: &str) -> String {
        self.seq += 1;
        blake3::hash(format!("{kind}:{}:{name}", self.seq).as_bytes())
            .to_hex()
            .to_string()
    }

    fn container_mut(&mut self, id: &ContainerId) -> Result<&mut MockContainer, RuntimeError> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("container {}", id.short())))
    }

    fn network_by_name(&self, name: &str) -> Option<NetworkId> {
        self.networks
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(id, _)| id.clone())
    }

    fn network_in_use(&self, id: &NetworkId, name: &str) -> bool {
        self.containers.values().any(|c| {
            c.connected.contains(id) || c.network == NetworkMode::Named(name.to_owned())
        })
    }

    fn volume_in_use(&self, name: &str) -> bool {
        self.containers.values().any(|c| {
            c.mounts
                .iter()
                .any(|m| m.source == MountSource::Volume(name.to_owned()))
        })
    }
}

/// In-memory container engine.
///
/// Volume data lives in real directories under the driver root so backup and
/// restore can be exercised. Every trait call is appended to a call log as
/// `"<method> <argument>"`.
pub struct MockDriver {
    root: PathBuf,
    state: Mutex<MockState>,
}

static ANON_ROOTS: AtomicU64 = AtomicU64::new(0);

impl Default for MockDriver {
    fn default() -> Self {
        let n = ANON_ROOTS.fetch_add(1, Ordering::Relaxed);
        Self::with_root(std::env::temp_dir().join(format!(
            "berth-mock-{}-{n}",
            std::process::id()
        )))
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::Engine(format!("mutex poisoned: {e}")))
    }

    fn inspect(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(state: &mut MockState, method: &str, arg: &str) {
        state.calls.push(format!("{method} {arg}"));
    }

    /// Make every pull of `reference` fail as if the registry lacked it.
    pub fn fail_pull(&self, reference: &str) {
        self.inspect().failing_pulls.insert(reference.to_owned());
    }

    /// Make every build whose tag contains `pattern` fail.
    pub fn fail_build(&self, pattern: &str) {
        self.inspect().failing_builds.push(pattern.to_owned());
    }

    pub fn calls(&self) -> Vec<String> {
        self.inspect().calls.clone()
    }

    /// Number of logged calls to `method`.
    pub fn call_count(&self, method: &str) -> usize {
        self.inspect()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(method))
            .count()
    }

    pub fn clear_calls(&self) {
        self.inspect().calls.clear();
    }

    pub fn containers(&self) -> Vec<(ContainerId, MockContainer)> {
        self.inspect()
            .containers
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect()
    }

    pub fn container_named(&self, name: &str) -> Option<(ContainerId, MockContainer)> {
        self.inspect()
            .containers
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, c)| (id.clone(), c.clone()))
    }

    pub fn network_named(&self, name: &str) -> Option<(NetworkId, MockNetwork)> {
        self.inspect()
            .networks
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(id, n)| (id.clone(), n.clone()))
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.inspect().volumes.values().cloned().collect()
    }

    pub fn image_count(&self) -> usize {
        self.inspect().images.len()
    }

    /// Drop a container behind the agent's back.
    pub fn forget_container(&self, id: &ContainerId) {
        self.inspect().containers.remove(id);
    }

    /// Change a container's run state behind the agent's back.
    pub fn set_running(&self, id: &ContainerId, running: bool) {
        if let Some(c) = self.inspect().containers.get_mut(id) {
            c.running = running;
        }
    }

    fn volume_dir(&self, name: &str) -> PathBuf {
        self.root.join("volumes").join(name)
    }
}

impl RuntimeDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn create_container(&self, spec: &ContainerCreate) -> Result<ContainerId, RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "create_container", &spec.name);
        if !state.images.contains_key(&spec.image) {
            return Err(RuntimeError::NotFound(format!("image {}", spec.image.short())));
        }
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Engine(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        if let NetworkMode::Named(ref net) = spec.network {
            if state.network_by_name(net).is_none() {
                return Err(RuntimeError::NotFound(format!("network {net}")));
            }
        }
        for mount in &spec.mounts {
            if let MountSource::Volume(ref name) = mount.source {
                if !state.volumes.values().any(|v| v == name) {
                    return Err(RuntimeError::NotFound(format!("volume {name}")));
                }
            }
        }
        let id = ContainerId::new(state.next_id("container", &spec.name));
        state.containers.insert(
            id.clone(),
            MockContainer {
                name: spec.name.clone(),
                image: spec.image.clone(),
                running: false,
                network: spec.network.clone(),
                connected: Vec::new(),
                mounts: spec.mounts.clone(),
                env: spec.env.clone(),
            },
        );
        Ok(id)
    }

    fn start_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "start_container", id);
        state.container_mut(id)?.running = true;
        Ok(())
    }

    fn stop_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "stop_container", id);
        state.container_mut(id)?.running = false;
        Ok(())
    }

    fn remove_container(&self, id: &ContainerId, _purge_volumes: bool) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "remove_container", id);
        state
            .containers
            .remove(id)
            .map(drop)
            .ok_or_else(|| RuntimeError::NotFound(format!("container {}", id.short())))
    }

    fn rename_container(&self, id: &ContainerId, new_name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "rename_container", new_name);
        if state
            .containers
            .iter()
            .any(|(other, c)| other != id && c.name == new_name)
        {
            return Err(RuntimeError::Engine(format!(
                "Conflict. The container name \"/{new_name}\" is already in use"
            )));
        }
        new_name.clone_into(&mut state.container_mut(id)?.name);
        Ok(())
    }

    fn container_running(&self, id: &ContainerId) -> Result<bool, RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "container_running", id);
        Ok(state.container_mut(id)?.running)
    }

    fn pull_image(&self, reference: &str) -> Result<ImageId, RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "pull_image", reference);
        if state.failing_pulls.contains(reference) {
            return Err(RuntimeError::NotFound(format!(
                "manifest for {reference} not found"
            )));
        }
        let digest = blake3::hash(reference.as_bytes()).to_hex();
        let id = ImageId::new(format!("sha256:{digest}"));
        state.images.insert(id.clone(), reference.to_owned());
        Ok(id)
    }

    fn build_image(&self, context: &Path, tag: &str) -> Result<ImageId, RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "build_image", tag);
        if state.failing_builds.iter().any(|p| tag.contains(p.as_str())) {
            return Err(RuntimeError::Build(format!("build of {tag} failed")));
        }
        if !context.join("Dockerfile").is_file() {
            return Err(RuntimeError::Build(format!(
                "no Dockerfile in {}",
                context.display()
            )));
        }
        let id = ImageId::new(format!("sha256:{}", state.next_id("image", tag)));
        state.images.insert(id.clone(), tag.to_owned());
        Ok(id)
    }

    fn remove_image(&self, image: &ImageId) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "remove_image", image);
        if state.containers.values().any(|c| &c.image == image) {
            return Err(RuntimeError::Engine(format!(
                "image {} is being used by a container",
                image.short()
            )));
        }
        state
            .images
            .remove(image)
            .map(drop)
            .ok_or_else(|| RuntimeError::NotFound(format!("image {}", image.short())))
    }

    fn prune_networks(&self) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "prune_networks", "");
        let unused: Vec<NetworkId> = state
            .networks
            .iter()
            .filter(|(id, n)| !state.network_in_use(id, &n.name))
            .map(|(id, _)| id.clone())
            .collect();
        for id in unused {
            state.networks.remove(&id);
        }
        Ok(())
    }

    fn prune_images(&self) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "prune_images", "");
        let used: HashSet<ImageId> = state.containers.values().map(|c| c.image.clone()).collect();
        state.images.retain(|id, _| used.contains(id));
        Ok(())
    }

    fn prune_volumes(&self) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "prune_volumes", "");
        let unused: Vec<(VolumeId, String)> = state
            .volumes
            .iter()
            .filter(|(_, name)| !state.volume_in_use(name))
            .map(|(id, name)| (id.clone(), name.clone()))
            .collect();
        for (id, name) in unused {
            state.volumes.remove(&id);
            let dir = self.volume_dir(&name);
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }
        Ok(())
    }

    fn create_network(&self, name: &str, internal: bool) -> Result<NetworkId, RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "create_network", name);
        if state.network_by_name(name).is_some() {
            return Err(RuntimeError::Engine(format!(
                "network with name {name} already exists"
            )));
        }
        let id = NetworkId::new(state.next_id("network", name));
        state.networks.insert(
            id.clone(),
            MockNetwork {
                name: name.to_owned(),
                internal,
            },
        );
        Ok(id)
    }

    fn find_network(&self, name: &str) -> Result<Option<NetworkId>, RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "find_network", name);
        Ok(state.network_by_name(name))
    }

    fn connect_network(
        &self,
        network: &NetworkId,
        container: &ContainerId,
        _aliases: &[String],
    ) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "connect_network", container);
        if !state.networks.contains_key(network) {
            return Err(RuntimeError::NotFound(format!("network {}", network.short())));
        }
        let c = state.container_mut(container)?;
        if !c.connected.contains(network) {
            c.connected.push(network.clone());
        }
        Ok(())
    }

    fn create_volume(&self, name: &str) -> Result<VolumeId, RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "create_volume", name);
        std::fs::create_dir_all(self.volume_dir(name))?;
        // Engines return the existing volume for a repeated name.
        if let Some((id, _)) = state.volumes.iter().find(|(_, v)| v.as_str() == name) {
            return Ok(id.clone());
        }
        let id = VolumeId::new(name);
        state.volumes.insert(id.clone(), name.to_owned());
        Ok(id)
    }

    fn remove_volume(&self, id: &VolumeId) -> Result<(), RuntimeError> {
        let mut state = self.state()?;
        Self::record(&mut state, "remove_volume", id);
        let name = state
            .volumes
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("volume {id}")))?;
        if state.volume_in_use(&name) {
            return Err(RuntimeError::Engine(format!("volume {name} is in use")));
        }
        state.volumes.remove(id);
        let dir = self.volume_dir(&name);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn volume_path(&self, id: &VolumeId) -> Result<PathBuf, RuntimeError> {
        let state = self.state()?;
        let name = state
            .volumes
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("volume {id}")))?;
        Ok(self.volume_dir(name))
    }
}
