//! One service's lifecycle state machine.
//!
//! Every state change is validated against [`validate_transition`] and
//! written to the service's `config.json` before the method returns, so the
//! record on disk always equals the in-memory record between steps. Runtime
//! failures inside an operation are converted into a failure status
//! (`builderror`, `inaccessible`, `error`) instead of being left half-applied
//! without trace.
//!
//! The `async_*` variants validate and enter the transitional status on the
//! caller's thread, then finish the work on a background thread owned by the
//! service. Only one such worker exists per service at a time.

use crate::build::{image_tag, BuildCoordinator, BuildJob, BuiltContainer};
use crate::{validate_transition, AgentContext, CoreError};
use berth_remote::{RemoteError, ServiceKind};
use berth_runtime::{ContainerCreate, Mount, MountSource, NetworkMode, RuntimeError};
use berth_schema::{
    sibling_url, ComposeFile, ContainerId, ContainerSpec, ImageId, ImageSource, ManifestFormat,
    ManifestOrigin, NetworkId, VersionedDescription,
};
use berth_store::{
    clear_dir, pack_dir, unpack_into, validate_service_name, ContainerRef, EnvStore, NetworkRef,
    ServiceRecord, ServiceStatus, VolumeRef,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// A declared variable that has no value yet and no default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredVariable {
    pub description: String,
    pub mutable: bool,
}

/// Keyed by variable name; private variables appear as `[<service>]<NAME>`.
pub type RequiredVariables = BTreeMap<String, RequiredVariable>;

struct ServiceState {
    record: ServiceRecord,
    description: Option<Arc<VersionedDescription>>,
}

pub struct Service {
    name: String,
    ctx: Arc<AgentContext>,
    private_env: EnvStore,
    state: Mutex<ServiceState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn ignore_not_found(result: Result<(), RuntimeError>) -> Result<(), RuntimeError> {
    match result {
        Err(e) if e.is_not_found() => {
            debug!("ignoring missing runtime object: {e}");
            Ok(())
        }
        other => other,
    }
}

fn remove_path(path: &std::path::Path) -> Result<(), CoreError> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

impl Service {
    /// A new, not yet persisted service in `empty` state.
    pub fn create(ctx: Arc<AgentContext>, name: &str) -> Result<Self, CoreError> {
        validate_service_name(name)?;
        let private_env = EnvStore::open(ctx.layout.service_env(name))?;
        Ok(Self {
            name: name.to_owned(),
            ctx,
            private_env,
            state: Mutex::new(ServiceState {
                record: ServiceRecord::default(),
                description: None,
            }),
            worker: Mutex::new(None),
        })
    }

    /// Reload a persisted service and reconcile its containers with `wanted`.
    ///
    /// A record left in a transitional status by a crash becomes `undefined`.
    /// Pending and failure states are kept as they are for the operator.
    pub fn load(ctx: Arc<AgentContext>, name: &str) -> Result<Self, CoreError> {
        validate_service_name(name)?;
        let record = ctx.records.get(name)?;
        let description = if record.actual_version.is_empty() {
            None
        } else {
            let dir = ctx.layout.version_dir(name, &record.actual_version);
            match VersionedDescription::load(&dir, &record.actual_version) {
                Ok(desc) => Some(Arc::new(desc)),
                Err(e) => {
                    warn!("service {name}: cannot load description {}: {e}", dir.display());
                    None
                }
            }
        };
        let private_env = EnvStore::open(ctx.layout.service_env(name))?;
        let service = Self {
            name: name.to_owned(),
            ctx,
            private_env,
            state: Mutex::new(ServiceState {
                record,
                description,
            }),
            worker: Mutex::new(None),
        };
        service.reconcile()?;
        Ok(service)
    }

    /// Drive the containers of a reloaded record to `wanted`.
    ///
    /// Only `running` and `paused` records take the result into their status.
    /// Pending and failure statuses are kept.
    fn reconcile(&self) -> Result<(), CoreError> {
        let status = self.status()?;
        if status.is_transitional() {
            warn!("service {}: {status} was interrupted", self.name);
            return self.set_status(ServiceStatus::Undefined);
        }
        if status == ServiceStatus::Deleted {
            return Ok(());
        }
        let wanted = self.should_run()?;
        if matches!(status, ServiceStatus::Running | ServiceStatus::Paused) {
            return match self.drive_containers(wanted) {
                Ok(()) => self.set_status(if wanted {
                    ServiceStatus::Running
                } else {
                    ServiceStatus::Paused
                }),
                Err(e) => {
                    self.fail(&e);
                    Ok(())
                }
            };
        }

        let containers = self.state()?.record.containers.actual.clone();
        for c in &containers {
            if let Err(e) = self.drive_container(&c.id, wanted) {
                warn!("service {} ({status}): {}: {e}", self.name, c.name);
            }
        }
        Ok(())
    }

    // --- state plumbing ---

    fn state(&self) -> Result<MutexGuard<'_, ServiceState>, CoreError> {
        self.state
            .lock()
            .map_err(|e| CoreError::Config(format!("service state mutex poisoned: {e}")))
    }

    fn persist(&self, record: &ServiceRecord) -> Result<(), CoreError> {
        self.ctx.records.put(&self.name, record).map_err(|e| {
            error!("service {}: failed to persist record: {e}", self.name);
            CoreError::from(e)
        })
    }

    /// Apply `f` to the record and persist it under the state lock.
    fn update_record<T>(&self, f: impl FnOnce(&mut ServiceRecord) -> T) -> Result<T, CoreError> {
        let mut state = self.state()?;
        let out = f(&mut state.record);
        self.persist(&state.record)?;
        Ok(out)
    }

    fn set_status(&self, to: ServiceStatus) -> Result<(), CoreError> {
        let mut state = self.state()?;
        self.write_status(&mut state.record, to)
    }

    fn write_status(&self, record: &mut ServiceRecord, to: ServiceStatus) -> Result<(), CoreError> {
        let from = record.status;
        validate_transition(from, to)?;
        record.status = to;
        self.persist(record)?;
        info!("service {}: {from} -> {to}", self.name);
        Ok(())
    }

    /// Hold the worker slot, refusing when a background operation still runs.
    ///
    /// Operations that change the status hold the slot until the new status
    /// is written, so a second caller waits and then sees it.
    fn claim(&self) -> Result<MutexGuard<'_, Option<JoinHandle<()>>>, CoreError> {
        let slot = self
            .worker
            .lock()
            .map_err(|e| CoreError::Config(format!("worker mutex poisoned: {e}")))?;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(CoreError::Busy(self.name.clone()));
        }
        Ok(slot)
    }

    fn refuse_transitional(&self, record: &ServiceRecord) -> Result<(), CoreError> {
        if record.status.is_transitional() {
            return Err(CoreError::Busy(self.name.clone()));
        }
        Ok(())
    }

    /// Refuse when busy, otherwise enter `to`.
    fn begin(&self, to: ServiceStatus) -> Result<(), CoreError> {
        let _slot = self.claim()?;
        let mut state = self.state()?;
        self.refuse_transitional(&state.record)?;
        self.write_status(&mut state.record, to)
    }

    /// Record a failed operation in the status field.
    fn fail(&self, err: &CoreError) {
        error!("service {}: {err}", self.name);
        let Ok(mut state) = self.state() else {
            return;
        };
        let from = state.record.status;
        let to = [err.status(), ServiceStatus::Error]
            .into_iter()
            .find(|to| validate_transition(from, *to).is_ok());
        if let Some(to) = to {
            state.record.status = to;
            if self.persist(&state.record).is_ok() {
                info!("service {}: {from} -> {to}", self.name);
            }
        }
    }

    fn guard<T>(&self, result: Result<T, CoreError>) -> Result<T, CoreError> {
        if let Err(ref e) = result {
            self.fail(e);
        }
        result
    }

    fn spawn(
        self: &Arc<Self>,
        label: &'static str,
        op: fn(&Service) -> Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        let mut slot = self
            .worker
            .lock()
            .map_err(|e| CoreError::Config(format!("worker mutex poisoned: {e}")))?;
        let service = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{label}-{}", self.name))
            .spawn(move || {
                if let Err(e) = op(&service) {
                    warn!("service {}: {label} ended with: {e}", service.name);
                }
            });
        match spawned {
            Ok(handle) => {
                *slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                let err = CoreError::Io(e);
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Block until the background operation, if any, has finished.
    pub fn wait(&self) -> Result<(), CoreError> {
        let handle = self
            .worker
            .lock()
            .map_err(|e| CoreError::Config(format!("worker mutex poisoned: {e}")))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| CoreError::Config(format!("worker of {} panicked", self.name)))?;
        }
        Ok(())
    }

    // --- read-only accessors ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Result<ServiceStatus, CoreError> {
        Ok(self.state()?.record.status)
    }

    pub fn installed_version(&self) -> Result<String, CoreError> {
        Ok(self.state()?.record.actual_version.clone())
    }

    pub fn previous_version(&self) -> Result<String, CoreError> {
        Ok(self.state()?.record.previous_version.clone())
    }

    pub fn has_previous(&self) -> Result<bool, CoreError> {
        Ok(self.state()?.record.has_previous())
    }

    pub fn should_run(&self) -> Result<bool, CoreError> {
        Ok(self.state()?.record.wanted)
    }

    /// Snapshot of the in-memory record.
    pub fn record(&self) -> Result<ServiceRecord, CoreError> {
        Ok(self.state()?.record.clone())
    }

    pub fn description(&self) -> Result<Option<Arc<VersionedDescription>>, CoreError> {
        Ok(self.state()?.description.clone())
    }

    pub fn private_env(&self) -> &EnvStore {
        &self.private_env
    }

    pub fn is_busy(&self) -> Result<bool, CoreError> {
        let running = match self.worker.try_lock() {
            Ok(slot) => slot.as_ref().is_some_and(|h| !h.is_finished()),
            Err(TryLockError::WouldBlock) => true,
            Err(TryLockError::Poisoned(e)) => {
                return Err(CoreError::Config(format!("worker mutex poisoned: {e}")))
            }
        };
        Ok(running || self.status()?.is_transitional())
    }

    /// Whether every actual container is running. No containers means not running.
    pub fn is_running(&self) -> Result<bool, CoreError> {
        let containers = self.state()?.record.containers.actual.clone();
        if containers.is_empty() {
            return Ok(false);
        }
        for c in &containers {
            if !self.ctx.driver.container_running(&c.id)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn current_description(&self) -> Result<Arc<VersionedDescription>, CoreError> {
        self.description()?
            .ok_or_else(|| CoreError::NoDescription(self.name.clone()))
    }

    // --- environment ---

    fn private_key(&self, name: &str) -> String {
        format!("[{}]{name}", self.name)
    }

    fn lookup(&self, name: &str) -> Result<Option<String>, CoreError> {
        Ok(match self.private_env.value(name)? {
            Some(v) => Some(v),
            None => self.ctx.env.value(name)?,
        })
    }

    /// Apply declared defaults, then report every variable still without a value.
    fn required_variables(
        &self,
        desc: &VersionedDescription,
    ) -> Result<RequiredVariables, CoreError> {
        let mut required = RequiredVariables::new();
        for decl in desc.environment() {
            if self.lookup(&decl.name)?.is_some() {
                continue;
            }
            if let Some(ref default) = decl.default {
                let store = if decl.private {
                    &self.private_env
                } else {
                    self.ctx.env.as_ref()
                };
                if store.store_if_absent(&decl.name, default, &decl.description, decl.mutable)? {
                    debug!("service {}: defaulted {}", self.name, decl.name);
                }
                continue;
            }
            let key = if decl.private {
                self.private_key(&decl.name)
            } else {
                decl.name.clone()
            };
            required.insert(
                key,
                RequiredVariable {
                    description: decl.description.clone(),
                    mutable: decl.mutable,
                },
            );
        }
        Ok(required)
    }

    fn missing_variables(&self, desc: &VersionedDescription) -> Result<Vec<String>, CoreError> {
        let mut missing = Vec::new();
        for decl in desc.environment() {
            if self.lookup(&decl.name)?.is_none() {
                missing.push(if decl.private {
                    self.private_key(&decl.name)
                } else {
                    decl.name.clone()
                });
            }
        }
        Ok(missing)
    }

    fn resolve_environment(
        &self,
        spec: &ContainerSpec,
    ) -> Result<BTreeMap<String, String>, CoreError> {
        let mut env = BTreeMap::new();
        let mut missing = Vec::new();
        for name in &spec.environment {
            match self.lookup(name)? {
                Some(value) => {
                    env.insert(name.clone(), value);
                }
                None => missing.push(name.clone()),
            }
        }
        if missing.is_empty() {
            Ok(env)
        } else {
            Err(CoreError::MissingVariables(missing))
        }
    }

    // --- manifests ---

    /// Download the manifest (and side-car files) of `version` into its version directory.
    fn fetch_description(&self, url: &str, version: &str) -> Result<VersionedDescription, CoreError> {
        info!("service {}: fetching description {version} from {url}", self.name);
        let manifests = &self.ctx.manifests;
        let manifest = manifests.download_text(url)?;
        let format = ManifestFormat::from_url(url);
        let mut env_files = BTreeMap::new();
        let desc = match format {
            ManifestFormat::Native => VersionedDescription::parse_native(version, url, &manifest)?,
            ManifestFormat::Compose => {
                for file in ComposeFile::parse(&manifest)?.env_file_names()? {
                    let content = manifests.download_text(&sibling_url(url, &file))?;
                    env_files.insert(file, content);
                }
                VersionedDescription::parse_compose(version, url, &manifest, env_files.clone())?
            }
        };
        let origin = ManifestOrigin {
            url: url.to_owned(),
            format,
        };
        let dir = self.ctx.layout.version_dir(&self.name, version);
        VersionedDescription::persist_files(&dir, version, &origin, &manifest, &env_files)?;
        Ok(desc)
    }

    // --- installation ---

    /// Fetch the description of `version` and report the variables the operator must supply.
    pub fn prepare_build(&self, url: &str, version: &str) -> Result<RequiredVariables, CoreError> {
        self.begin(ServiceStatus::Preparing)?;
        let result = self.guard(self.run_prepare_build(url, version));
        if let Ok(ref required) = result {
            info!(
                "service {}: {version} prepared, {} variable(s) required",
                self.name,
                required.len()
            );
        }
        result
    }

    fn run_prepare_build(&self, url: &str, version: &str) -> Result<RequiredVariables, CoreError> {
        let desc = Arc::new(self.fetch_description(url, version)?);
        let required = self.required_variables(&desc)?;
        {
            let mut state = self.state()?;
            state.record.actual_version = version.to_owned();
            state.description = Some(desc);
            self.persist(&state.record)?;
        }
        self.set_status(ServiceStatus::InstallPending)?;
        Ok(required)
    }

    /// Build every container once all variables have values.
    ///
    /// Returns `false` and stays in `installPending` while variables are missing.
    pub fn continue_installation(&self) -> Result<bool, CoreError> {
        self.begin(ServiceStatus::Installing)?;
        self.run_installation()
    }

    /// Enter `installing` and build on a background thread.
    pub fn async_continue_installation(self: &Arc<Self>) -> Result<(), CoreError> {
        let desc = self.current_description()?;
        let missing = self.missing_variables(&desc)?;
        if !missing.is_empty() {
            return Err(CoreError::MissingVariables(missing));
        }
        self.begin(ServiceStatus::Installing)?;
        self.spawn("install", |s| s.run_installation().map(drop))
    }

    fn run_installation(&self) -> Result<bool, CoreError> {
        let desc = self.guard(self.current_description())?;
        let missing = self.missing_variables(&desc)?;
        if !missing.is_empty() {
            info!(
                "service {}: waiting for variables {}",
                self.name,
                missing.join(", ")
            );
            self.set_status(ServiceStatus::InstallPending)?;
            return Ok(false);
        }
        self.guard(self.install_containers(&desc))?;
        self.set_status(ServiceStatus::Paused)?;
        Ok(true)
    }

    /// Networks and volumes, then every container in parallel.
    fn install_containers(&self, desc: &VersionedDescription) -> Result<(), CoreError> {
        self.build_infrastructure(desc)?;

        let userdata = self.ctx.userdata_path()?;
        let mut jobs = Vec::with_capacity(desc.container_count());
        for spec in desc.containers() {
            jobs.push(self.build_job(desc, spec, &userdata)?);
        }

        let expected = jobs.len();
        let outcome = BuildCoordinator::from_context(&self.ctx).run(jobs);
        let mut built = outcome.built;
        built.sort_by_key(|b| {
            desc.containers()
                .iter()
                .position(|c| c.name == b.name)
                .unwrap_or(usize::MAX)
        });

        for container in &built {
            self.update_record(|r| {
                r.containers.actual.push(ContainerRef {
                    name: container.name.clone(),
                    id: container.id.clone(),
                    image: container.image.clone(),
                });
            })?;
            if let Some(spec) = desc.container(&container.name) {
                self.connect_secondary_networks(spec, container)?;
            }
        }

        if built.len() != expected {
            for (name, e) in &outcome.failures {
                warn!("service {}: container {name}: {e}", self.name);
            }
            return Err(CoreError::IncompleteBuild {
                expected,
                built: built.len(),
            });
        }
        info!("service {}: {expected} container(s) created", self.name);
        Ok(())
    }

    fn build_job(
        &self,
        desc: &VersionedDescription,
        spec: &ContainerSpec,
        userdata: &std::path::Path,
    ) -> Result<BuildJob, CoreError> {
        let mut mounts: Vec<Mount> = spec
            .volumes
            .iter()
            .map(|v| Mount {
                source: MountSource::Volume(v.name.clone()),
                target: v.mountpoint.clone(),
            })
            .collect();
        if let Some(ref target) = spec.userdata {
            mounts.push(Mount {
                source: MountSource::Bind(userdata.to_path_buf()),
                target: target.clone(),
            });
        }
        let network = match spec.primary_network() {
            Some(n) if n.host => NetworkMode::Host,
            Some(n) => NetworkMode::Named(n.name.clone()),
            None => NetworkMode::Default,
        };
        let initial_image = match spec.image {
            ImageSource::Pull { ref reference } => reference.clone(),
            ImageSource::Build { .. } => String::new(),
        };
        Ok(BuildJob {
            source: spec.image.clone(),
            tag: image_tag(&self.name, &spec.name, desc.version()),
            container: ContainerCreate {
                name: spec.name.clone(),
                hostname: spec.hostname.clone(),
                image: ImageId::new(initial_image),
                ports: spec.ports.clone(),
                mounts,
                env: self.resolve_environment(spec)?,
                network,
            },
        })
    }

    fn connect_secondary_networks(
        &self,
        spec: &ContainerSpec,
        container: &BuiltContainer,
    ) -> Result<(), CoreError> {
        for attachment in spec.secondary_networks().iter().filter(|n| !n.host) {
            let network = self.network_id(&attachment.name)?;
            debug!(
                "service {}: connecting {} to {}",
                self.name, container.name, attachment.name
            );
            self.ctx.driver.connect_network(
                &network,
                &container.id,
                std::slice::from_ref(&spec.hostname),
            )?;
        }
        Ok(())
    }

    /// Create declared volumes and networks this service does not hold yet.
    fn build_infrastructure(&self, desc: &VersionedDescription) -> Result<(), CoreError> {
        for volume in desc.volumes() {
            if self.state()?.record.volume(&volume.name).is_some() {
                continue;
            }
            let id = self.ctx.driver.create_volume(&volume.name)?;
            debug!("service {}: volume {} created", self.name, volume.name);
            self.update_record(|r| {
                r.volumes.push(VolumeRef {
                    id,
                    name: volume.name.clone(),
                });
            })?;
        }

        for network in desc.networks() {
            if self.state()?.record.network(&network.name).is_some() {
                continue;
            }
            let id = if network.name == self.ctx.global_network() {
                self.ctx.ensure_global_network()?
            } else {
                self.obtain_network(&network.name, network.internal)?
            };
            self.update_record(|r| {
                r.networks.push(NetworkRef {
                    id,
                    name: network.name.clone(),
                });
            })?;
        }
        Ok(())
    }

    fn obtain_network(&self, name: &str, internal: bool) -> Result<NetworkId, CoreError> {
        if let Some(id) = self.ctx.networks.get(name)? {
            return Ok(id);
        }
        let id = match self.ctx.driver.create_network(name, internal) {
            Ok(id) => id,
            Err(RuntimeError::Engine(msg)) => self
                .ctx
                .driver
                .find_network(name)?
                .ok_or(RuntimeError::Engine(msg))?,
            Err(e) => return Err(e.into()),
        };
        debug!("service {}: network {name} ready", self.name);
        self.ctx.networks.insert(name, id.clone())?;
        Ok(id)
    }

    /// Id of a network referenced by a container.
    fn network_id(&self, name: &str) -> Result<NetworkId, CoreError> {
        if let Some(n) = self.state()?.record.network(name) {
            return Ok(n.id.clone());
        }
        if name == self.ctx.global_network() {
            return self.ctx.ensure_global_network();
        }
        if let Some(id) = self.ctx.networks.get(name)? {
            return Ok(id);
        }
        self.ctx
            .driver
            .find_network(name)?
            .ok_or_else(|| RuntimeError::NotFound(format!("network {name}")).into())
    }

    // --- start / stop ---

    /// Drive every actual container to `run`, skipping those already there.
    fn drive_containers(&self, run: bool) -> Result<(), CoreError> {
        let containers = self.state()?.record.containers.actual.clone();
        for c in &containers {
            self.drive_container(&c.id, run)?;
        }
        Ok(())
    }

    fn drive_container(&self, id: &ContainerId, run: bool) -> Result<(), CoreError> {
        let driver = &self.ctx.driver;
        if driver.container_running(id)? == run {
            return Ok(());
        }
        if run {
            driver.start_container(id)?;
        } else {
            driver.stop_container(id)?;
        }
        Ok(())
    }

    fn apply_wanted(&self, wanted: bool) -> Result<(), CoreError> {
        self.update_record(|r| r.wanted = wanted)?;
        self.drive_containers(wanted)
    }

    fn control(&self, wanted: bool) -> Result<(), CoreError> {
        let _slot = self.claim()?;
        let target = if wanted {
            ServiceStatus::Running
        } else {
            ServiceStatus::Paused
        };
        {
            let state = self.state()?;
            self.refuse_transitional(&state.record)?;
            validate_transition(state.record.status, target)?;
        }
        self.guard(self.apply_wanted(wanted))?;
        self.set_status(target)
    }

    pub fn start(&self) -> Result<(), CoreError> {
        self.control(true)
    }

    pub fn stop(&self) -> Result<(), CoreError> {
        self.control(false)
    }

    // --- update ---

    /// Fetch `version`, rotate the version fields, and report required variables.
    ///
    /// Leftovers of an earlier previous version are purged first.
    pub fn prepare_update(&self, url: &str, version: &str) -> Result<RequiredVariables, CoreError> {
        let _slot = self.claim()?;
        let actual = {
            let state = self.state()?;
            self.refuse_transitional(&state.record)?;
            validate_transition(state.record.status, ServiceStatus::UpdatePending)?;
            state.record.actual_version.clone()
        };
        if actual.is_empty() {
            return Err(CoreError::NoDescription(self.name.clone()));
        }
        if actual == version {
            return Err(CoreError::SameVersion(self.name.clone(), actual));
        }
        self.guard(self.run_prepare_update(url, version))
    }

    fn run_prepare_update(&self, url: &str, version: &str) -> Result<RequiredVariables, CoreError> {
        self.purge_previous()?;
        let desc = Arc::new(self.fetch_description(url, version)?);
        {
            let mut state = self.state()?;
            let record = &mut state.record;
            record.previous_version = std::mem::replace(&mut record.actual_version, version.to_owned());
            state.description = Some(Arc::clone(&desc));
            self.persist(&state.record)?;
        }
        let required = self.required_variables(&desc)?;
        self.set_status(ServiceStatus::UpdatePending)?;
        Ok(required)
    }

    /// Remove the previous version's containers, manifest directory and backups.
    fn purge_previous(&self) -> Result<(), CoreError> {
        let record = self.record()?;
        let previous = &record.previous_version;
        if previous.is_empty() && record.containers.previous.is_empty() {
            return Ok(());
        }
        info!("service {}: purging previous version {previous}", self.name);
        for c in &record.containers.previous {
            if let Err(e) = ignore_not_found(self.ctx.driver.stop_container(&c.id)) {
                warn!("service {}: stopping {}: {e}", self.name, c.name);
            }
            ignore_not_found(self.ctx.driver.remove_container(&c.id, false))?;
        }
        if !previous.is_empty() {
            if *previous != record.actual_version {
                remove_path(&self.ctx.layout.version_dir(&self.name, previous))?;
            }
            for v in &record.volumes {
                remove_path(&self.ctx.layout.backup_path(&v.name, previous))?;
            }
        }
        self.update_record(|r| {
            r.containers.previous.clear();
            r.previous_version.clear();
        })
    }

    /// Back up volumes, retire the running containers and build the new version.
    pub fn update(&self) -> Result<(), CoreError> {
        self.begin(ServiceStatus::Updating)?;
        self.run_update()
    }

    pub fn async_update(self: &Arc<Self>) -> Result<(), CoreError> {
        let desc = self.current_description()?;
        let missing = self.missing_variables(&desc)?;
        if !missing.is_empty() {
            return Err(CoreError::MissingVariables(missing));
        }
        self.begin(ServiceStatus::Updating)?;
        self.spawn("update", Service::run_update)
    }

    fn run_update(&self) -> Result<(), CoreError> {
        let desc = self.guard(self.current_description())?;
        let missing = self.missing_variables(&desc)?;
        if !missing.is_empty() {
            self.set_status(ServiceStatus::UpdatePending)?;
            return Err(CoreError::MissingVariables(missing));
        }
        self.guard(self.update_steps(&desc))?;
        self.set_status(ServiceStatus::Running)
    }

    fn update_steps(&self, desc: &VersionedDescription) -> Result<(), CoreError> {
        let record = self.record()?;
        let previous = record.previous_version.clone();

        self.drive_containers(false)?;
        self.backup_volumes(&record.volumes, &previous)?;

        for c in &record.containers.actual {
            let retired = ContainerRef::retired_name(&c.name, &previous);
            self.ctx.driver.rename_container(&c.id, &retired)?;
        }
        self.update_record(ServiceRecord::retire_actual)?;

        self.install_containers(desc)?;
        self.apply_wanted(true)
    }

    /// Archive every volume to its version-tagged backup. Containers must be stopped.
    fn backup_volumes(&self, volumes: &[VolumeRef], version: &str) -> Result<(), CoreError> {
        for v in volumes {
            let source = self.ctx.driver.volume_path(&v.id)?;
            let dest = self.ctx.layout.backup_path(&v.name, version);
            remove_path(&dest)?;
            pack_dir(&source, &dest)?;
            info!("service {}: volume {} backed up", self.name, v.name);
        }
        Ok(())
    }

    // --- revert ---

    /// Reinstate the previous containers and restore volume backups.
    ///
    /// Whether the repository permits the revert is checked by the caller.
    pub fn revert(&self) -> Result<(), CoreError> {
        self.ensure_revertible()?;
        self.begin(ServiceStatus::Reverting)?;
        self.run_revert()
    }

    pub fn async_revert(self: &Arc<Self>) -> Result<(), CoreError> {
        self.ensure_revertible()?;
        self.begin(ServiceStatus::Reverting)?;
        self.spawn("revert", Service::run_revert)
    }

    fn ensure_revertible(&self) -> Result<(), CoreError> {
        let state = self.state()?;
        if state.record.has_previous() && !state.record.containers.previous.is_empty() {
            Ok(())
        } else {
            Err(CoreError::RevertNotAllowed(self.name.clone()))
        }
    }

    fn run_revert(&self) -> Result<(), CoreError> {
        self.guard(self.revert_steps())?;
        self.set_status(ServiceStatus::Running)
    }

    fn revert_steps(&self) -> Result<(), CoreError> {
        let record = self.record()?;
        let previous = record.previous_version.clone();
        let actual = record.actual_version.clone();
        let desc = VersionedDescription::load(
            &self.ctx.layout.version_dir(&self.name, &previous),
            &previous,
        )?;

        self.drive_containers(false)?;
        for c in &record.containers.actual {
            ignore_not_found(self.ctx.driver.remove_container(&c.id, false))?;
        }
        self.update_record(|r| r.containers.actual.clear())?;

        for c in &record.containers.previous {
            let original = ContainerRef::original_name(&c.name, &previous);
            self.ctx.driver.rename_container(&c.id, original)?;
        }
        self.update_record(ServiceRecord::reinstate_previous)?;

        let (kept, added): (Vec<_>, Vec<_>) = record
            .volumes
            .iter()
            .partition(|v| desc.volumes().iter().any(|d| d.name == v.name));
        for v in &added {
            ignore_not_found(self.ctx.driver.remove_volume(&v.id))?;
            info!("service {}: volume {} dropped", self.name, v.name);
        }
        self.update_record(|r| {
            r.volumes.retain(|v| kept.iter().any(|k| k.name == v.name));
            r.networks
                .retain(|n| desc.networks().iter().any(|d| d.name == n.name));
        })?;

        for v in &kept {
            let backup = self.ctx.layout.backup_path(&v.name, &previous);
            if !backup.exists() {
                warn!("service {}: no backup for volume {}", self.name, v.name);
                continue;
            }
            let target = self.ctx.driver.volume_path(&v.id)?;
            clear_dir(&target)?;
            unpack_into(&backup, &target)?;
            fs::remove_file(&backup)?;
            info!("service {}: volume {} restored", self.name, v.name);
        }

        self.state()?.description = Some(Arc::new(desc));
        self.apply_wanted(true)?;

        if actual != previous {
            remove_path(&self.ctx.layout.version_dir(&self.name, &actual))?;
        }
        self.update_record(|r| {
            r.actual_version = std::mem::take(&mut r.previous_version);
        })
    }

    // --- rebuild ---

    /// Recreate every container from the current description.
    pub fn rebuild(&self) -> Result<(), CoreError> {
        self.begin(ServiceStatus::Installing)?;
        self.run_rebuild()
    }

    pub fn prepare_rebuild(self: &Arc<Self>) -> Result<(), CoreError> {
        self.current_description()?;
        self.begin(ServiceStatus::Installing)?;
        self.spawn("rebuild", Service::run_rebuild)
    }

    fn run_rebuild(&self) -> Result<(), CoreError> {
        self.guard(self.rebuild_steps())?;
        self.set_status(ServiceStatus::Running)
    }

    fn rebuild_steps(&self) -> Result<(), CoreError> {
        let desc = self.current_description()?;
        let containers = self.record()?.containers.actual;
        for c in &containers {
            ignore_not_found(self.ctx.driver.stop_container(&c.id))?;
            ignore_not_found(self.ctx.driver.remove_container(&c.id, false))?;
        }
        self.update_record(|r| r.containers.actual.clear())?;
        self.install_containers(&desc)?;
        self.apply_wanted(true)
    }

    // --- delete ---

    /// Refuse essential services before anything touches the runtime.
    fn ensure_removable(&self) -> Result<(), CoreError> {
        match self.ctx.manifests.service_kind(&self.name) {
            Ok(ServiceKind::Essential) => Err(CoreError::Essential(self.name.clone())),
            Ok(_) | Err(RemoteError::UnknownService(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete(&self) -> Result<(), CoreError> {
        self.ensure_removable()?;
        self.begin(ServiceStatus::Deleting)?;
        self.run_delete()
    }

    pub fn async_delete(self: &Arc<Self>) -> Result<(), CoreError> {
        self.ensure_removable()?;
        self.begin(ServiceStatus::Deleting)?;
        self.spawn("delete", Service::run_delete)
    }

    fn run_delete(&self) -> Result<(), CoreError> {
        self.guard(self.delete_steps())?;
        self.set_status(ServiceStatus::Deleted)?;
        self.ctx.records.remove(&self.name)?;
        info!("service {}: removed", self.name);
        Ok(())
    }

    fn delete_steps(&self) -> Result<(), CoreError> {
        let record = self.record()?;
        let driver = &self.ctx.driver;

        for c in record
            .containers
            .actual
            .iter()
            .chain(&record.containers.previous)
        {
            if let Err(e) = ignore_not_found(driver.stop_container(&c.id)) {
                warn!("service {}: stopping {}: {e}", self.name, c.name);
            }
            ignore_not_found(driver.remove_container(&c.id, true))?;
        }
        self.update_record(|r| {
            r.containers.actual.clear();
            r.containers.previous.clear();
        })?;

        for v in &record.volumes {
            ignore_not_found(driver.remove_volume(&v.id))?;
            if record.has_previous() {
                remove_path(&self.ctx.layout.backup_path(&v.name, &record.previous_version))?;
            }
        }
        self.update_record(|r| r.volumes.clear())?;

        if let Err(e) = driver.prune_networks() {
            warn!("network prune failed: {e}");
        }
        if let Err(e) = driver.prune_images() {
            warn!("image prune failed: {e}");
        }
        for n in &record.networks {
            if n.name != self.ctx.global_network() {
                self.ctx.networks.remove(&n.name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_remote::{ManifestClient, StaticTransport};
    use berth_runtime::MockDriver;
    use berth_store::StoreLayout;

    const REPO: &str = "mem://repo";

    fn index() -> String {
        format!(
            r#"{{"modules": {{
                "wiki": {{"type": "plugin", "versions": [
                    {{"version": "1.0.0", "url": "{REPO}/wiki/service_1.0.0.json"}},
                    {{"version": "1.1.0", "url": "{REPO}/wiki/service_1.1.0.json", "revert": true}}
                ]}},
                "core": {{"type": "essential", "versions": [
                    {{"version": "1.0.0", "url": "{REPO}/core/service_1.0.0.json"}}
                ]}}
            }}}}"#
        )
    }

    const WIKI: &str = r#"{
        "containers": [
            {"name": "db", "prebuilt": {"name": "mariadb", "version": "10.6"},
             "networks": [{"name": "wiki_internal"}],
             "volumes": [{"name": "wiki_db", "mountpoint": "/var/lib/mysql"}],
             "environment": ["DB_PASS"]},
            {"name": "web", "prebuilt": {"name": "wiki"},
             "networks": [{"name": "wiki_internal"}, {"name": "berth"}],
             "environment": ["DB_PASS", "WIKI_TITLE"]}
        ],
        "networks": [{"name": "wiki_internal", "internal": true}, {"name": "berth"}],
        "volumes": [{"name": "wiki_db"}],
        "environment": [
            {"name": "DB_PASS", "description": "database password", "mutable": false},
            {"name": "WIKI_TITLE", "description": "title", "mutable": true, "default": "Wiki"}
        ]
    }"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        driver: Arc<MockDriver>,
        ctx: Arc<AgentContext>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MockDriver::with_root(dir.path().join("engine")));
        let transport = Arc::new(StaticTransport::new());
        transport.insert(&format!("{REPO}/repository.json"), index());
        transport.insert(&format!("{REPO}/wiki/service_1.0.0.json"), WIKI);
        transport.insert(&format!("{REPO}/wiki/service_1.1.0.json"), WIKI);
        let manifests = Arc::new(ManifestClient::new(
            format!("{REPO}/repository.json"),
            transport,
        ));
        let ctx = Arc::new(
            AgentContext::new(
                StoreLayout::new(dir.path().join("store")),
                driver.clone(),
                manifests,
                "berth",
            )
            .unwrap(),
        );
        Fixture {
            _dir: dir,
            driver,
            ctx,
        }
    }

    fn url(version: &str) -> String {
        format!("{REPO}/wiki/service_{version}.json")
    }

    fn installed(f: &Fixture) -> Service {
        f.ctx
            .env
            .store_value("DB_PASS", "secret", "", false)
            .unwrap();
        let service = Service::create(f.ctx.clone(), "wiki").unwrap();
        service.prepare_build(&url("1.0.0"), "1.0.0").unwrap();
        assert!(service.continue_installation().unwrap());
        service
    }

    #[test]
    fn prepare_build_reports_missing_variable_and_applies_default() {
        let f = fixture();
        let service = Service::create(f.ctx.clone(), "wiki").unwrap();
        let required = service.prepare_build(&url("1.0.0"), "1.0.0").unwrap();
        assert_eq!(required.keys().collect::<Vec<_>>(), ["DB_PASS"]);
        assert!(!required["DB_PASS"].mutable);
        assert_eq!(service.status().unwrap(), ServiceStatus::InstallPending);
        assert_eq!(f.ctx.env.value("WIKI_TITLE").unwrap().as_deref(), Some("Wiki"));
        assert!(f
            .ctx
            .layout
            .version_dir("wiki", "1.0.0")
            .join("service_1.0.0.json")
            .exists());
    }

    #[test]
    fn prepare_build_only_from_empty() {
        let f = fixture();
        let service = installed(&f);
        let err = service.prepare_build(&url("1.0.0"), "1.0.0").unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[test]
    fn continue_installation_waits_for_variables() {
        let f = fixture();
        let service = Service::create(f.ctx.clone(), "wiki").unwrap();
        service.prepare_build(&url("1.0.0"), "1.0.0").unwrap();
        assert!(!service.continue_installation().unwrap());
        assert_eq!(service.status().unwrap(), ServiceStatus::InstallPending);
        assert_eq!(f.driver.call_count("create_container"), 0);
    }

    #[test]
    fn installation_creates_infrastructure_and_ends_paused() {
        let f = fixture();
        let service = installed(&f);
        let record = service.record().unwrap();
        assert_eq!(record.status, ServiceStatus::Paused);
        assert_eq!(record.containers.actual.len(), 2);
        assert_eq!(record.containers.actual[0].name, "db");
        assert_eq!(record.volumes.len(), 1);
        assert_eq!(record.networks.len(), 2);

        let (_, web) = f.driver.container_named("web").unwrap();
        assert_eq!(web.network, NetworkMode::Named("wiki_internal".into()));
        assert_eq!(web.connected.len(), 1);
        assert_eq!(web.env["DB_PASS"], "secret");
        assert_eq!(web.env["WIKI_TITLE"], "Wiki");
        assert!(!web.running);
    }

    #[test]
    fn start_is_idempotent() {
        let f = fixture();
        let service = installed(&f);
        service.start().unwrap();
        let starts = f.driver.call_count("start_container");
        assert_eq!(starts, 2);
        service.start().unwrap();
        assert_eq!(f.driver.call_count("start_container"), starts);
        assert_eq!(service.status().unwrap(), ServiceStatus::Running);
        assert!(service.is_running().unwrap());
    }

    #[test]
    fn stop_clears_wanted() {
        let f = fixture();
        let service = installed(&f);
        service.start().unwrap();
        service.stop().unwrap();
        assert!(!service.should_run().unwrap());
        assert_eq!(service.status().unwrap(), ServiceStatus::Paused);
        assert!(!service.is_running().unwrap());
    }

    #[test]
    fn start_from_install_pending_is_rejected() {
        let f = fixture();
        let service = Service::create(f.ctx.clone(), "wiki").unwrap();
        service.prepare_build(&url("1.0.0"), "1.0.0").unwrap();
        assert!(matches!(
            service.start().unwrap_err(),
            CoreError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn failed_pull_records_builderror() {
        let f = fixture();
        f.driver.fail_pull("wiki:latest");
        f.ctx
            .env
            .store_value("DB_PASS", "secret", "", false)
            .unwrap();
        let service = Service::create(f.ctx.clone(), "wiki").unwrap();
        service.prepare_build(&url("1.0.0"), "1.0.0").unwrap();
        let err = service.continue_installation().unwrap_err();
        assert!(matches!(
            err,
            CoreError::IncompleteBuild {
                expected: 2,
                built: 1
            }
        ));
        let record = service.record().unwrap();
        assert_eq!(record.status, ServiceStatus::Builderror);
        assert_eq!(record.containers.actual.len(), 1);
    }

    #[test]
    fn same_version_update_rejected() {
        let f = fixture();
        let service = installed(&f);
        assert!(matches!(
            service.prepare_update(&url("1.0.0"), "1.0.0").unwrap_err(),
            CoreError::SameVersion(..)
        ));
        assert_eq!(service.status().unwrap(), ServiceStatus::Paused);
    }

    #[test]
    fn revert_without_previous_is_refused() {
        let f = fixture();
        let service = installed(&f);
        assert!(matches!(
            service.revert().unwrap_err(),
            CoreError::RevertNotAllowed(_)
        ));
        assert_eq!(service.status().unwrap(), ServiceStatus::Paused);
    }

    #[test]
    fn load_reconciles_with_wanted() {
        let f = fixture();
        let service = installed(&f);
        service.start().unwrap();
        let (id, _) = f.driver.container_named("db").unwrap();
        f.driver.set_running(&id, false);
        drop(service);

        let reloaded = Service::load(f.ctx.clone(), "wiki").unwrap();
        assert_eq!(reloaded.status().unwrap(), ServiceStatus::Running);
        assert!(f.driver.container_named("db").unwrap().1.running);
        assert!(reloaded.description().unwrap().is_some());
    }

    #[test]
    fn load_marks_interrupted_operation_undefined() {
        let f = fixture();
        let service = installed(&f);
        let mut record = service.record().unwrap();
        record.status = ServiceStatus::Updating;
        f.ctx.records.put("wiki", &record).unwrap();
        drop(service);

        let reloaded = Service::load(f.ctx.clone(), "wiki").unwrap();
        assert_eq!(reloaded.status().unwrap(), ServiceStatus::Undefined);
    }

    #[test]
    fn load_maps_vanished_container_to_inaccessible() {
        let f = fixture();
        let service = installed(&f);
        service.start().unwrap();
        let (id, _) = f.driver.container_named("web").unwrap();
        f.driver.forget_container(&id);
        drop(service);

        let reloaded = Service::load(f.ctx.clone(), "wiki").unwrap();
        assert_eq!(reloaded.status().unwrap(), ServiceStatus::Inaccessible);
    }

    #[test]
    fn load_restarts_wanted_containers_while_update_pending() {
        let f = fixture();
        let service = installed(&f);
        service.start().unwrap();
        service.prepare_update(&url("1.1.0"), "1.1.0").unwrap();
        let (id, _) = f.driver.container_named("db").unwrap();
        f.driver.set_running(&id, false);
        drop(service);

        let reloaded = Service::load(f.ctx.clone(), "wiki").unwrap();
        assert_eq!(reloaded.status().unwrap(), ServiceStatus::UpdatePending);
        assert!(reloaded.should_run().unwrap());
        assert!(f.driver.container_named("db").unwrap().1.running);
    }

    #[test]
    fn load_drives_remaining_containers_but_keeps_failure_status() {
        let f = fixture();
        let service = installed(&f);
        service.start().unwrap();
        let mut record = service.record().unwrap();
        record.status = ServiceStatus::Error;
        f.ctx.records.put("wiki", &record).unwrap();
        let (db, _) = f.driver.container_named("db").unwrap();
        f.driver.forget_container(&db);
        let (web, _) = f.driver.container_named("web").unwrap();
        f.driver.set_running(&web, false);
        drop(service);

        let reloaded = Service::load(f.ctx.clone(), "wiki").unwrap();
        assert_eq!(reloaded.status().unwrap(), ServiceStatus::Error);
        assert!(f.driver.container_named("web").unwrap().1.running);
    }

    #[test]
    fn busy_while_transitional() {
        let f = fixture();
        let service = installed(&f);
        let mut record = service.record().unwrap();
        record.status = ServiceStatus::Deleting;
        service.state().unwrap().record = record;
        assert!(matches!(service.start().unwrap_err(), CoreError::Busy(_)));
        assert!(service.is_busy().unwrap());
    }

    #[test]
    fn control_waits_for_an_operation_in_flight() {
        let f = fixture();
        let service = Arc::new(installed(&f));
        let slot = service.claim().unwrap();
        assert!(service.is_busy().unwrap());

        let other = Arc::clone(&service);
        let start = thread::spawn(move || other.start());
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!start.is_finished());
        assert_eq!(service.status().unwrap(), ServiceStatus::Paused);

        drop(slot);
        start.join().unwrap().unwrap();
        assert_eq!(service.status().unwrap(), ServiceStatus::Running);
        assert!(!service.is_busy().unwrap());
    }

    #[test]
    fn prepare_update_refuses_while_transitional() {
        let f = fixture();
        let service = installed(&f);
        service.state().unwrap().record.status = ServiceStatus::Updating;
        assert!(matches!(
            service.prepare_update(&url("1.1.0"), "1.1.0").unwrap_err(),
            CoreError::Busy(_)
        ));
        assert_eq!(service.installed_version().unwrap(), "1.0.0");
    }
}
