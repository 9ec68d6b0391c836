use crate::http::Transport;
use crate::repository::{AvailableService, RepositoryIndex, ServiceKind};
use crate::version::compare_versions;
use crate::RemoteError;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default lifetime of a fetched repository index.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CachedIndex {
    fetched_at: Instant,
    index: Arc<RepositoryIndex>,
}

/// Answers version queries against the repository index, refetching it once
/// the cached copy is older than the TTL.
pub struct ManifestClient {
    index_url: String,
    transport: Arc<dyn Transport>,
    ttl: Duration,
    cache: Mutex<Option<CachedIndex>>,
}

impl ManifestClient {
    pub fn new(index_url: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            index_url: index_url.into(),
            transport,
            ttl: DEFAULT_TTL,
            cache: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn index_url(&self) -> &str {
        &self.index_url
    }

    fn cache(&self) -> Result<MutexGuard<'_, Option<CachedIndex>>, RemoteError> {
        self.cache
            .lock()
            .map_err(|e| RemoteError::Io(std::io::Error::other(format!("cache poisoned: {e}"))))
    }

    /// The cached index, refetched when stale. A failed refetch falls back to
    /// the stale copy if there is one.
    pub fn index(&self) -> Result<Arc<RepositoryIndex>, RemoteError> {
        let mut cache = self.cache()?;
        if let Some(ref cached) = *cache {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&cached.index));
            }
        }
        match self.fetch_index() {
            Ok(index) => {
                let index = Arc::new(index);
                *cache = Some(CachedIndex {
                    fetched_at: Instant::now(),
                    index: Arc::clone(&index),
                });
                Ok(index)
            }
            Err(e) => match *cache {
                Some(ref stale) => {
                    warn!("repository refresh failed, using cached index: {e}");
                    Ok(Arc::clone(&stale.index))
                }
                None => Err(e),
            },
        }
    }

    /// Drop the cached index so the next query refetches it.
    pub fn invalidate(&self) -> Result<(), RemoteError> {
        *self.cache()? = None;
        Ok(())
    }

    fn fetch_index(&self) -> Result<RepositoryIndex, RemoteError> {
        debug!("fetching repository index from {}", self.index_url);
        let data = self.transport.get(&self.index_url)?;
        RepositoryIndex::parse(&data)
    }

    pub fn resolve_url(&self, service: &str, version: &str) -> Result<Option<String>, RemoteError> {
        self.index()?.resolve_url(service, version)
    }

    pub fn latest_available(&self, service: &str) -> Result<Option<String>, RemoteError> {
        self.index()?.latest_available(service)
    }

    pub fn latest_compatible(&self, service: &str, installed: &str) -> Result<String, RemoteError> {
        self.index()?.latest_compatible(service, installed)
    }

    pub fn is_revert_possible(&self, service: &str, from_version: &str) -> Result<bool, RemoteError> {
        self.index()?.is_revert_possible(service, from_version)
    }

    pub fn compare_versions(&self, a: &str, b: &str) -> Result<Ordering, RemoteError> {
        compare_versions(a, b)
    }

    pub fn list_available(&self, kind: ServiceKind) -> Result<Vec<AvailableService>, RemoteError> {
        Ok(self.index()?.list_available(kind))
    }

    pub fn service_kind(&self, service: &str) -> Result<ServiceKind, RemoteError> {
        self.index()?.service_kind(service)
    }

    /// Fetch any file through the client's transport.
    pub fn download(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        self.transport.get(url)
    }

    pub fn download_text(&self, url: &str) -> Result<String, RemoteError> {
        String::from_utf8(self.download(url)?)
            .map_err(|e| RemoteError::Serialization(format!("{url} is not UTF-8: {e}")))
    }
}
