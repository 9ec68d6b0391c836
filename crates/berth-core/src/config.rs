use crate::CoreError;
use berth_remote::RemoteConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent settings read from `agent.toml`. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub store_root: PathBuf,
    pub listen: String,
    pub repository_url: String,
    pub repository_token: Option<String>,
    pub driver: String,
    pub refresh_secs: u64,
    pub global_network: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("/var/lib/berth"),
            listen: "127.0.0.1:49100".to_owned(),
            repository_url: "file:///srv/berth/repository".to_owned(),
            repository_token: None,
            driver: "docker".to_owned(),
            refresh_secs: 300,
            global_network: "berth".to_owned(),
        }
    }
}

impl AgentConfig {
    pub const DEFAULT_PATH: &'static str = "/etc/berth/agent.toml";

    pub fn parse(content: &str) -> Result<Self, CoreError> {
        toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Defaults when `path` does not exist; a present but invalid file is an error.
    pub fn load_or_default(path: &Path) -> Result<Self, CoreError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn remote(&self) -> RemoteConfig {
        let config = RemoteConfig::new(&self.repository_url);
        match &self.repository_token {
            Some(token) => config.with_token(token),
            None => config,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        assert_eq!(AgentConfig::parse("").unwrap(), AgentConfig::default());
    }

    #[test]
    fn partial_file_overrides_fields() {
        let config = AgentConfig::parse(
            r#"
store_root = "/tmp/berth"
driver = "mock"
repository_url = "https://repo.example.org/stable/"
repository_token = "secret"
"#,
        )
        .unwrap();
        assert_eq!(config.store_root, PathBuf::from("/tmp/berth"));
        assert_eq!(config.driver, "mock");
        assert_eq!(config.listen, "127.0.0.1:49100");
        assert_eq!(config.refresh_interval(), Duration::from_secs(300));
        let remote = config.remote();
        assert_eq!(remote.url, "https://repo.example.org/stable");
        assert_eq!(remote.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn unknown_field_rejected() {
        let err = AgentConfig::parse("stor_root = \"/x\"").unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_or_default(&dir.path().join("agent.toml")).unwrap();
        assert_eq!(config.global_network, "berth");
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "refresh_secs = 10\nglobal_network = \"fleet\"\n").unwrap();
        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.refresh_secs, 10);
        assert_eq!(config.global_network, "fleet");
    }
}
