use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of the agent's state root.
///
/// ```text
/// <root>/
///   version                      format marker
///   agent.json                   agent-wide record (global network)
///   env.json                     shared environment variables
///   apitoken                     control surface key
///   services/<name>/config.json  persisted service record
///   services/<name>/env.json     service-private variables
///   services/<name>/versions/<v>/ downloaded manifest files
///   buildcache/                  scratch space for build archives
///   backups/<volume>_<v>.tar     volume content saved before an update
///   userdata/                    shared user data bind source
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn services_dir(&self) -> PathBuf {
        self.root.join("services")
    }

    #[inline]
    pub fn service_dir(&self, name: &str) -> PathBuf {
        self.services_dir().join(name)
    }

    #[inline]
    pub fn service_config(&self, name: &str) -> PathBuf {
        self.service_dir(name).join("config.json")
    }

    #[inline]
    pub fn service_env(&self, name: &str) -> PathBuf {
        self.service_dir(name).join("env.json")
    }

    #[inline]
    pub fn version_dir(&self, name: &str, version: &str) -> PathBuf {
        self.service_dir(name).join("versions").join(version)
    }

    #[inline]
    pub fn buildcache_dir(&self) -> PathBuf {
        self.root.join("buildcache")
    }

    #[inline]
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    /// Backup archive of `volume` taken while `version` was installed.
    #[inline]
    pub fn backup_path(&self, volume: &str, version: &str) -> PathBuf {
        self.backups_dir().join(format!("{volume}_{version}.tar"))
    }

    #[inline]
    pub fn userdata_dir(&self) -> PathBuf {
        self.root.join("userdata")
    }

    #[inline]
    pub fn env_file(&self) -> PathBuf {
        self.root.join("env.json")
    }

    #[inline]
    pub fn agent_file(&self) -> PathBuf {
        self.root.join("agent.json")
    }

    #[inline]
    pub fn api_token_file(&self) -> PathBuf {
        self.root.join("apitoken")
    }

    #[inline]
    pub fn setup_marker(&self) -> PathBuf {
        self.root.join(".setup-done")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.services_dir())?;
        fs::create_dir_all(self.buildcache_dir())?;
        fs::create_dir_all(self.backups_dir())?;
        fs::create_dir_all(self.userdata_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            crate::write_atomic(&version_path, serde_json::to_string_pretty(&ver)?.as_bytes())?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.root.join(VERSION_FILE))?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = StoreLayout::new("/var/lib/berth");
        assert_eq!(
            layout.service_config("wiki"),
            PathBuf::from("/var/lib/berth/services/wiki/config.json")
        );
        assert_eq!(
            layout.version_dir("wiki", "1.2.0"),
            PathBuf::from("/var/lib/berth/services/wiki/versions/1.2.0")
        );
        assert_eq!(
            layout.backup_path("wiki_db", "1.2.0"),
            PathBuf::from("/var/lib/berth/backups/wiki_db_1.2.0.tar")
        );
        assert_eq!(layout.env_file(), PathBuf::from("/var/lib/berth/env.json"));
        assert_eq!(
            layout.service_env("wiki"),
            PathBuf::from("/var/lib/berth/services/wiki/env.json")
        );
    }

    #[test]
    fn initialize_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();

        assert!(layout.services_dir().is_dir());
        assert!(layout.buildcache_dir().is_dir());
        assert!(layout.backups_dir().is_dir());
        assert!(layout.userdata_dir().is_dir());
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
    }

    #[test]
    fn incompatible_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("version"), r#"{"format_version": 99}"#).unwrap();
        let layout = StoreLayout::new(dir.path());
        assert!(matches!(
            layout.initialize(),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));
    }
}
