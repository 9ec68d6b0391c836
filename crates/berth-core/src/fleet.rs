//! All services of one agent, keyed by name.
//!
//! This is the surface the HTTP control API and the CLI drive. Lifecycle
//! requests that take long are started on the service's worker thread and
//! return the transitional status right away; callers poll
//! [`Fleet::action_status`] or [`Fleet::status_report`].

use crate::service::{RequiredVariables, Service};
use crate::{random_string, AgentConfig, AgentContext, CoreError};
use berth_remote::{RemoteError, ServiceKind};
use berth_runtime::RuntimeError;
use berth_store::{validate_service_name, EnvEntry, ServiceStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Per-service line of the status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReport {
    pub name: String,
    pub version: String,
    pub wanted: bool,
    pub status: ServiceStatus,
    pub running: bool,
    /// Empty unless the repository permits reverting to it.
    pub previous: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableEntry {
    pub name: String,
    pub description: String,
    pub subscription: bool,
    pub installed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheck {
    pub actual_version: String,
    pub latest_possible: String,
}

/// One variable written through [`Fleet::store_env`].
///
/// An `id` of the form `[<service>]<NAME>` targets that service's private store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvUpdate {
    pub id: String,
    pub value: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mutable: bool,
}

/// Result of a lifecycle request: the variables still needed, or the status entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionResult {
    Status(ServiceStatus),
    Required(RequiredVariables),
}

impl ActionResult {
    fn from_required(required: RequiredVariables, otherwise: ServiceStatus) -> Self {
        if required.is_empty() {
            Self::Status(otherwise)
        } else {
            Self::Required(required)
        }
    }
}

fn split_private_key(id: &str) -> Option<(&str, &str)> {
    let rest = id.strip_prefix('[')?;
    let (service, name) = rest.split_once(']')?;
    (!service.is_empty() && !name.is_empty()).then_some((service, name))
}

pub struct Fleet {
    ctx: Arc<AgentContext>,
    services: Mutex<BTreeMap<String, Arc<Service>>>,
}

impl Fleet {
    /// Load every persisted service, reconciling containers with `wanted`.
    pub fn open(ctx: Arc<AgentContext>) -> Result<Self, CoreError> {
        let address = ctx.env.refresh_host_address()?;
        debug!("host network address {address}");

        let mut services = BTreeMap::new();
        for name in ctx.records.list()? {
            let service = match Service::load(Arc::clone(&ctx), &name) {
                Ok(s) => s,
                Err(e) => {
                    warn!("skipping service {name}: {e}");
                    continue;
                }
            };
            let record = service.record()?;
            if record.status == ServiceStatus::Deleted {
                info!("dropping deleted service {name}");
                ctx.records.remove(&name)?;
                continue;
            }
            for network in &record.networks {
                ctx.networks.insert(&network.name, network.id.clone())?;
            }
            services.insert(name, Arc::new(service));
        }
        info!("fleet opened with {} service(s)", services.len());
        Ok(Self {
            ctx,
            services: Mutex::new(services),
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, CoreError> {
        Self::open(Arc::new(AgentContext::from_config(config)?))
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    fn services(&self) -> Result<MutexGuard<'_, BTreeMap<String, Arc<Service>>>, CoreError> {
        self.services
            .lock()
            .map_err(|e| CoreError::Config(format!("fleet mutex poisoned: {e}")))
    }

    pub fn get(&self, name: &str) -> Result<Arc<Service>, CoreError> {
        self.services()?
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::ServiceNotFound(name.to_owned()))
    }

    pub fn names(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.services()?.keys().cloned().collect())
    }

    pub fn is_installed(&self, name: &str) -> Result<bool, CoreError> {
        Ok(self.services()?.contains_key(name))
    }

    // --- setup ---

    pub fn is_set_up(&self) -> bool {
        self.ctx.layout.setup_marker().exists()
    }

    /// Seed shared variables, create the global network and API token, and
    /// install every essential service. Runs once per store.
    pub fn first_setup(&self) -> Result<Vec<String>, CoreError> {
        if self.is_set_up() {
            return Err(CoreError::AlreadySetUp);
        }
        let env = &self.ctx.env;
        env.store_value("MYSQL_DATABASE", "berth", "Name of the main database", false)?;
        env.store_value("MYSQL_USER", "berth_mysql_user", "User of the main database", false)?;
        env.store_value(
            "MYSQL_PASSWORD",
            &random_string(128),
            "Internal password of the main database",
            false,
        )?;
        env.store_value(
            "MANAGEMENT_APIS_SHARED_SECRET",
            &random_string(256),
            "Shared secret of the management APIs",
            false,
        )?;
        env.store_if_absent(
            "USERDATA",
            &self.ctx.layout.userdata_dir().to_string_lossy(),
            "Directory holding user data",
            false,
        )?;

        self.ctx.ensure_global_network()?;

        let token_path = self.ctx.layout.api_token_file();
        fs::write(&token_path, random_string(512))?;
        fs::set_permissions(&token_path, fs::Permissions::from_mode(0o600))?;

        let mut installed = Vec::new();
        for module in self.ctx.manifests.list_available(ServiceKind::Essential)? {
            info!("installing essential service {}", module.name);
            let (service, _) = self.install_blocking(&module.name)?;
            if !service.continue_installation()? {
                warn!(
                    "essential service {} waits for environment variables",
                    module.name
                );
            }
            installed.push(module.name);
        }

        fs::write(self.ctx.layout.setup_marker(), b"")?;
        info!("first setup complete");
        Ok(installed)
    }

    /// Secret expected in the `apikey` field of control requests.
    pub fn api_token(&self) -> Result<String, CoreError> {
        Ok(fs::read_to_string(self.ctx.layout.api_token_file())?
            .trim()
            .to_owned())
    }

    // --- keyed operations ---

    /// Prepare the latest available version of `name` and register it.
    pub fn install(&self, name: &str) -> Result<ActionResult, CoreError> {
        let (_, required) = self.install_blocking(name)?;
        Ok(ActionResult::from_required(
            required,
            ServiceStatus::InstallPending,
        ))
    }

    /// Register `name` and run `prepare_build`; nothing stays behind on failure.
    fn install_blocking(
        &self,
        name: &str,
    ) -> Result<(Arc<Service>, RequiredVariables), CoreError> {
        validate_service_name(name)?;
        let manifests = &self.ctx.manifests;
        let version = manifests
            .latest_available(name)
            .map_err(|e| match e {
                RemoteError::UnknownService(_) => CoreError::NotAvailable(name.to_owned()),
                other => other.into(),
            })?
            .ok_or_else(|| CoreError::NotAvailable(name.to_owned()))?;
        let url = manifests
            .resolve_url(name, &version)?
            .ok_or_else(|| CoreError::NotAvailable(name.to_owned()))?;

        let service = {
            let mut services = self.services()?;
            if services.contains_key(name) || self.ctx.records.exists(name) {
                return Err(CoreError::ServiceExists(name.to_owned()));
            }
            let service = Arc::new(Service::create(Arc::clone(&self.ctx), name)?);
            services.insert(name.to_owned(), Arc::clone(&service));
            service
        };

        match service.prepare_build(&url, &version) {
            Ok(required) => Ok((service, required)),
            Err(e) => {
                self.services()?.remove(name);
                if let Err(cleanup) = self.ctx.records.remove(name) {
                    warn!("service {name}: cleanup after failed install: {cleanup}");
                }
                Err(e)
            }
        }
    }

    /// Start or stop `name`; returns the resulting status.
    pub fn control(&self, name: &str, start: bool) -> Result<ServiceStatus, CoreError> {
        let service = self.get(name)?;
        if start {
            service.start()?;
        } else {
            service.stop()?;
        }
        service.status()
    }

    pub fn delete(&self, name: &str) -> Result<ServiceStatus, CoreError> {
        let service = self.get(name)?;
        service.async_delete()?;
        Ok(ServiceStatus::Deleting)
    }

    /// Prepare an update of `name` to `version`.
    pub fn execute_update(&self, name: &str, version: &str) -> Result<ActionResult, CoreError> {
        let service = self.get(name)?;
        let url = self
            .ctx
            .manifests
            .resolve_url(name, version)?
            .ok_or_else(|| CoreError::NotAvailable(format!("{name} {version}")))?;
        let required = service.prepare_update(&url, version)?;
        Ok(ActionResult::from_required(
            required,
            ServiceStatus::UpdatePending,
        ))
    }

    /// Advance a pending operation, or report the current status.
    pub fn action_status(&self, name: &str) -> Result<ServiceStatus, CoreError> {
        let service = self.get(name)?;
        match service.status()? {
            ServiceStatus::UpdatePending => {
                service.async_update()?;
                Ok(ServiceStatus::Updating)
            }
            ServiceStatus::InstallPending => {
                service.async_continue_installation()?;
                Ok(ServiceStatus::Installing)
            }
            ServiceStatus::Deleted => {
                self.services()?.remove(name);
                Ok(ServiceStatus::Deleted)
            }
            other => Ok(other),
        }
    }

    fn revert_permitted(&self, service: &Service) -> Result<bool, CoreError> {
        if !service.has_previous()? {
            return Ok(false);
        }
        Ok(self
            .ctx
            .manifests
            .is_revert_possible(service.name(), &service.installed_version()?)?)
    }

    pub fn execute_revert(&self, name: &str) -> Result<ServiceStatus, CoreError> {
        let service = self.get(name)?;
        if !self.revert_permitted(&service)? {
            return Err(CoreError::RevertNotAllowed(name.to_owned()));
        }
        service.async_revert()?;
        Ok(ServiceStatus::Reverting)
    }

    pub fn rebuild(&self, name: &str) -> Result<ServiceStatus, CoreError> {
        let service = self.get(name)?;
        service.prepare_rebuild()?;
        Ok(ServiceStatus::Installing)
    }

    pub fn update_check(&self, name: &str) -> Result<UpdateCheck, CoreError> {
        let service = self.get(name)?;
        let actual_version = service.installed_version()?;
        let latest_possible = self
            .ctx
            .manifests
            .latest_compatible(name, &actual_version)?;
        Ok(UpdateCheck {
            actual_version,
            latest_possible,
        })
    }

    pub fn status_report(&self) -> Result<Vec<ServiceReport>, CoreError> {
        let services: Vec<Arc<Service>> = self.services()?.values().cloned().collect();
        let mut report = Vec::with_capacity(services.len());
        for service in services {
            let name = service.name().to_owned();
            let running = service.is_running().unwrap_or_else(|e| {
                debug!("service {name}: running check failed: {e}");
                false
            });
            let previous = match self.revert_permitted(&service) {
                Ok(true) => service.previous_version()?,
                Ok(false) => String::new(),
                Err(e) => {
                    debug!("service {name}: revert check failed: {e}");
                    String::new()
                }
            };
            let kind = match self.ctx.manifests.service_kind(&name) {
                Ok(kind) => kind.as_str().to_owned(),
                Err(_) => "unknown".to_owned(),
            };
            report.push(ServiceReport {
                version: service.installed_version()?,
                wanted: service.should_run()?,
                status: service.status()?,
                running,
                previous,
                kind,
                name,
            });
        }
        Ok(report)
    }

    pub fn available(&self, kind: ServiceKind) -> Result<Vec<AvailableEntry>, CoreError> {
        let services = self.services()?;
        Ok(self
            .ctx
            .manifests
            .list_available(kind)?
            .into_iter()
            .map(|s| AvailableEntry {
                installed: services.contains_key(&s.name),
                name: s.name,
                description: s.description,
                subscription: s.subscription,
            })
            .collect())
    }

    // --- environment ---

    /// Shared variables plus every service's private ones as `[<service>]<NAME>`.
    pub fn list_env(&self) -> Result<BTreeMap<String, EnvEntry>, CoreError> {
        let mut all = self.ctx.env.entries()?;
        let services: Vec<Arc<Service>> = self.services()?.values().cloned().collect();
        for service in services {
            for (name, entry) in service.private_env().entries()? {
                all.insert(format!("[{}]{name}", service.name()), entry);
            }
        }
        Ok(all)
    }

    pub fn store_env(&self, updates: &[EnvUpdate]) -> Result<(), CoreError> {
        for update in updates {
            if let Some((service, name)) = split_private_key(&update.id) {
                self.get(service)?.private_env().store_value(
                    name,
                    &update.value,
                    &update.description,
                    update.mutable,
                )?;
            } else {
                self.ctx.env.store_value(
                    &update.id,
                    &update.value,
                    &update.description,
                    update.mutable,
                )?;
            }
            debug!("stored variable {}", update.id);
        }
        Ok(())
    }

    // --- maintenance ---

    /// Block until no service has a background operation running.
    pub fn wait_idle(&self) -> Result<(), CoreError> {
        let services: Vec<Arc<Service>> = self.services()?.values().cloned().collect();
        for service in services {
            service.wait()?;
        }
        Ok(())
    }

    /// Force-remove every recorded container and prune unused engine objects.
    ///
    /// Records are left untouched. Returns the number of containers removed.
    pub fn purge(&self) -> Result<usize, CoreError> {
        let driver = &self.ctx.driver;
        let services: Vec<Arc<Service>> = self.services()?.values().cloned().collect();
        let mut removed = 0;
        for service in services {
            let record = service.record()?;
            for c in record
                .containers
                .actual
                .iter()
                .chain(&record.containers.previous)
            {
                if let Err(e) = driver.stop_container(&c.id) {
                    debug!("purge: stop {}: {e}", c.name);
                }
                match driver.remove_container(&c.id, true) {
                    Ok(()) => removed += 1,
                    Err(RuntimeError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        driver.prune_images()?;
        driver.prune_networks()?;
        driver.prune_volumes()?;
        warn!("purged {removed} container(s)");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_keys_are_split() {
        assert_eq!(split_private_key("[wiki]SECRET"), Some(("wiki", "SECRET")));
        assert_eq!(split_private_key("SECRET"), None);
        assert_eq!(split_private_key("[]SECRET"), None);
        assert_eq!(split_private_key("[wiki]"), None);
        assert_eq!(split_private_key("[wiki SECRET"), None);
    }

    #[test]
    fn action_result_serializes_untagged() {
        let status =
            ActionResult::from_required(RequiredVariables::new(), ServiceStatus::InstallPending);
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"installPending\"");
    }

    #[test]
    fn report_uses_type_key() {
        let report = ServiceReport {
            name: "wiki".into(),
            version: "1.0.0".into(),
            wanted: true,
            status: ServiceStatus::Running,
            running: true,
            previous: String::new(),
            kind: "plugin".into(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "plugin");
        assert_eq!(json["status"], "running");
    }
}
