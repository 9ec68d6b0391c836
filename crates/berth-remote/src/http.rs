use crate::{RemoteConfig, RemoteError, USER_AGENT};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Fetches the raw bytes behind a URL.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str) -> Result<Vec<u8>, RemoteError>;
}

/// `ureq`-based transport. `file://` URLs are read from the local filesystem,
/// which serves offline mirrors of the repository.
pub struct HttpTransport {
    config: Option<RemoteConfig>,
    agent: ureq::Agent,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self {
            config: None,
            agent: ureq::Agent::new_with_defaults(),
        }
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `config.auth_token` as a bearer token to requests below `config.url`.
    pub fn with_config(config: RemoteConfig) -> Self {
        Self {
            config: Some(config),
            ..Self::default()
        }
    }

    fn token_for(&self, url: &str) -> Option<&str> {
        let config = self.config.as_ref()?;
        if url.starts_with(&config.url) {
            config.auth_token.as_deref()
        } else {
            None
        }
    }

    fn get_file(path: &Path) -> Result<Vec<u8>, RemoteError> {
        std::fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RemoteError::NotFound(path.display().to_string())
            } else {
                RemoteError::Io(e)
            }
        })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        if let Some(path) = url.strip_prefix("file://") {
            tracing::debug!("read {path}");
            return Self::get_file(Path::new(path));
        }

        tracing::debug!("GET {url}");
        let mut req = self.agent.get(url).header("User-Agent", USER_AGENT);
        if let Some(token) = self.token_for(url) {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = match req.call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => {
                return Err(RemoteError::NotFound(url.to_owned()));
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(RemoteError::Http(format!("HTTP {code} for {url}")));
            }
            Err(e) => {
                return Err(RemoteError::Http(e.to_string()));
            }
        };

        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        Ok(body)
    }
}

/// Serves fixed content from memory and counts fetches.
#[derive(Default)]
pub struct StaticTransport {
    content: Mutex<BTreeMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl StaticTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, data: impl Into<Vec<u8>>) {
        self.content
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_owned(), data.into());
    }

    pub fn remove(&self, url: &str) {
        self.content
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url);
    }

    /// Number of `get` calls served so far, including misses.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Transport for StaticTransport {
    fn get(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.content
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(url.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_urls_read_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repository.json");
        std::fs::write(&path, b"{}").unwrap();
        let t = HttpTransport::new();
        assert_eq!(t.get(&format!("file://{}", path.display())).unwrap(), b"{}");
    }

    #[test]
    fn missing_file_is_not_found() {
        let t = HttpTransport::new();
        assert!(matches!(
            t.get("file:///nonexistent/berth/repository.json"),
            Err(RemoteError::NotFound(_))
        ));
    }

    #[test]
    fn token_only_sent_below_configured_url() {
        let t = HttpTransport::with_config(
            RemoteConfig::new("https://repo.example/berth/").with_token("t0k"),
        );
        assert_eq!(
            t.token_for("https://repo.example/berth/repository.json"),
            Some("t0k")
        );
        assert_eq!(t.token_for("https://mirror.example/wiki.tar.gz"), None);
        assert_eq!(HttpTransport::new().token_for("https://repo.example"), None);
    }

    #[test]
    fn unreachable_host_is_http_error() {
        let t = HttpTransport::new();
        assert!(matches!(
            t.get("http://127.0.0.1:1/repository.json"),
            Err(RemoteError::Http(_))
        ));
    }

    #[test]
    fn static_transport_serves_and_counts() {
        let t = StaticTransport::new();
        t.insert("mem://a", "alpha");
        assert_eq!(t.get("mem://a").unwrap(), b"alpha");
        assert!(matches!(t.get("mem://b"), Err(RemoteError::NotFound(_))));
        assert_eq!(t.fetch_count(), 2);
        t.remove("mem://a");
        assert!(t.get("mem://a").is_err());
    }
}
