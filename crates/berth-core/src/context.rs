use crate::{AgentConfig, CoreError};
use berth_remote::{HttpTransport, ManifestClient};
use berth_runtime::{select_driver, RuntimeDriver, RuntimeError};
use berth_schema::NetworkId;
use berth_store::{AgentRecord, EnvStore, NetworkRef, RecordStore, StoreLayout};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Networks known to the agent by name, shared by every service.
#[derive(Debug, Default)]
pub struct NetworkRegistry {
    networks: Mutex<BTreeMap<String, NetworkId>>,
}

impl NetworkRegistry {
    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, NetworkId>>, CoreError> {
        self.networks
            .lock()
            .map_err(|e| CoreError::Config(format!("network registry mutex poisoned: {e}")))
    }

    pub fn get(&self, name: &str) -> Result<Option<NetworkId>, CoreError> {
        Ok(self.lock()?.get(name).cloned())
    }

    pub fn insert(&self, name: &str, id: NetworkId) -> Result<(), CoreError> {
        self.lock()?.insert(name.to_owned(), id);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<(), CoreError> {
        self.lock()?.remove(name);
        Ok(())
    }

    pub fn names(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

/// Collaborators shared by every service of one agent.
pub struct AgentContext {
    pub layout: StoreLayout,
    pub records: RecordStore,
    pub driver: Arc<dyn RuntimeDriver>,
    pub manifests: Arc<ManifestClient>,
    /// Shared environment store (`<root>/env.json`).
    pub env: Arc<EnvStore>,
    pub networks: NetworkRegistry,
    global_network: String,
    agent_lock: Mutex<()>,
}

impl AgentContext {
    pub fn new(
        layout: StoreLayout,
        driver: Arc<dyn RuntimeDriver>,
        manifests: Arc<ManifestClient>,
        global_network: &str,
    ) -> Result<Self, CoreError> {
        layout.initialize()?;
        let env = Arc::new(EnvStore::open(layout.env_file())?);
        Ok(Self {
            records: RecordStore::new(layout.clone()),
            layout,
            driver,
            manifests,
            env,
            networks: NetworkRegistry::default(),
            global_network: global_network.to_owned(),
            agent_lock: Mutex::new(()),
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, CoreError> {
        let layout = StoreLayout::new(&config.store_root);
        let driver = select_driver(&config.driver, &config.store_root)?;
        let remote = config.remote();
        let transport = Arc::new(HttpTransport::with_config(remote.clone()));
        let manifests = ManifestClient::new(remote.index_url(), transport)
            .with_ttl(config.refresh_interval());
        debug!(
            "agent context: root={} driver={} repository={}",
            config.store_root.display(),
            driver.name(),
            remote.url
        );
        Self::new(layout, driver, Arc::new(manifests), &config.global_network)
    }

    pub fn global_network(&self) -> &str {
        &self.global_network
    }

    /// Id of the agent-wide network, creating it on first use.
    ///
    /// The id is recorded in `agent.json`; a recorded id the engine no longer
    /// knows is replaced.
    pub fn ensure_global_network(&self) -> Result<NetworkId, CoreError> {
        let _guard = self
            .agent_lock
            .lock()
            .map_err(|e| CoreError::Config(format!("agent record mutex poisoned: {e}")))?;
        let mut record = AgentRecord::load(&self.layout)?;
        let name = self.global_network.as_str();

        let id = match self.driver.find_network(name)? {
            Some(id) => id,
            None => {
                info!("creating global network {name}");
                match self.driver.create_network(name, false) {
                    Ok(id) => id,
                    Err(RuntimeError::Engine(msg)) => self
                        .driver
                        .find_network(name)?
                        .ok_or(RuntimeError::Engine(msg))?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if record.global_network.as_ref().map(|n| &n.id) != Some(&id) {
            record.global_network = Some(NetworkRef {
                id: id.clone(),
                name: name.to_owned(),
            });
            record.save(&self.layout)?;
        }
        self.networks.insert(name, id.clone())?;
        Ok(id)
    }

    /// Host directory bound at a container's `userdata` mountpoint.
    pub fn userdata_path(&self) -> Result<PathBuf, CoreError> {
        Ok(match self.env.value("USERDATA")? {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => self.layout.userdata_dir(),
        })
    }
}
