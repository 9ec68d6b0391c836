//! Parallel image acquisition and container creation for one service.
//!
//! Every container gets its own worker. Workers take exactly one job from a
//! pre-filled queue, acquire the image (pull, or download + extract + build),
//! create the container, and send the result back over a channel. A failing
//! worker only loses its own container; the caller compares the number of
//! results with the number of jobs.

use crate::{random_string, AgentContext, CoreError};
use berth_remote::ManifestClient;
use berth_runtime::{ContainerCreate, RuntimeDriver};
use berth_schema::{ContainerId, ImageId, ImageSource};
use berth_store::{extract_tar_gz, sole_directory};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

/// One unit of work: acquire `source`, then create `container` on top of it.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub source: ImageSource,
    /// Tag given to images built from a source archive.
    pub tag: String,
    /// Creation parameters; the image field is replaced by the acquired image.
    pub container: ContainerCreate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltContainer {
    pub name: String,
    pub id: ContainerId,
    pub image: ImageId,
}

/// Results in completion order, not job order.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub built: Vec<BuiltContainer>,
    pub failures: Vec<(String, CoreError)>,
}

impl BuildOutcome {
    pub fn is_complete(&self, expected: usize) -> bool {
        self.built.len() == expected
    }
}

/// Tag of an image built for `container` of `service` at `version`.
pub fn image_tag(service: &str, container: &str, version: &str) -> String {
    format!("berth/{service}_{container}:{version}").to_lowercase()
}

pub struct BuildCoordinator {
    driver: Arc<dyn RuntimeDriver>,
    manifests: Arc<ManifestClient>,
    cache_dir: PathBuf,
}

impl BuildCoordinator {
    pub fn new(
        driver: Arc<dyn RuntimeDriver>,
        manifests: Arc<ManifestClient>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            driver,
            manifests,
            cache_dir: cache_dir.into(),
        }
    }

    pub fn from_context(ctx: &AgentContext) -> Self {
        Self::new(
            Arc::clone(&ctx.driver),
            Arc::clone(&ctx.manifests),
            ctx.layout.buildcache_dir(),
        )
    }

    /// Run every job on its own worker and wait for all of them.
    pub fn run(&self, jobs: Vec<BuildJob>) -> BuildOutcome {
        let workers = jobs.len();
        let queue = Mutex::new(VecDeque::from(jobs));
        let (tx, rx) = mpsc::channel();

        info!("building {workers} container(s)");
        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || {
                    let job = queue.lock().ok().and_then(|mut q| q.pop_front());
                    let Some(job) = job else {
                        return;
                    };
                    let name = job.container.name.clone();
                    let result = self.build_one(job);
                    let _ = tx.send((name, result));
                });
            }
        });
        drop(tx);

        let mut outcome = BuildOutcome::default();
        for (name, result) in rx {
            match result {
                Ok(built) => {
                    debug!("container {name} created as {}", built.id.short());
                    outcome.built.push(built);
                }
                Err(e) => {
                    warn!("container {name} failed: {e}");
                    outcome.failures.push((name, e));
                }
            }
        }
        outcome
    }

    fn build_one(&self, job: BuildJob) -> Result<BuiltContainer, CoreError> {
        let BuildJob {
            source,
            tag,
            mut container,
        } = job;
        let image = match &source {
            ImageSource::Pull { reference } => self.driver.pull_image(reference)?,
            ImageSource::Build { url } => self.build_from_source(&container.name, url, &tag)?,
        };
        container.image = image.clone();
        let id = self.driver.create_container(&container)?;
        Ok(BuiltContainer {
            name: container.name,
            id,
            image,
        })
    }

    fn build_from_source(&self, name: &str, url: &str, tag: &str) -> Result<ImageId, CoreError> {
        let stem = format!("{name}_{}", random_string(10));
        let archive = self.cache_dir.join(format!("{stem}.tar.gz"));
        let work = self.cache_dir.join(&stem);

        let result = self.fetch_and_build(url, tag, &archive, &work);

        for path in [&archive, &work] {
            let cleanup = if path.is_dir() {
                fs::remove_dir_all(path)
            } else if path.exists() {
                fs::remove_file(path)
            } else {
                Ok(())
            };
            if let Err(e) = cleanup {
                warn!("failed to clean build cache {}: {e}", path.display());
            }
        }
        result
    }

    fn fetch_and_build(
        &self,
        url: &str,
        tag: &str,
        archive: &Path,
        work: &Path,
    ) -> Result<ImageId, CoreError> {
        debug!("downloading build source {url}");
        fs::create_dir_all(&self.cache_dir)?;
        fs::write(archive, self.manifests.download(url)?)?;
        extract_tar_gz(archive, work)?;
        fs::remove_file(archive)?;
        let context = sole_directory(work)?;
        info!("building image {tag}");
        Ok(self.driver.build_image(&context, tag)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_remote::StaticTransport;
    use berth_runtime::{MockDriver, NetworkMode};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::BTreeMap;

    fn source_tarball(dockerfile: bool) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut add = |path: &str, data: &[u8]| {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, data).unwrap();
        };
        add("app/index.html", b"<html/>");
        if dockerfile {
            add("app/Dockerfile", b"FROM scratch\n");
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn job(name: &str, source: ImageSource) -> BuildJob {
        BuildJob {
            tag: image_tag("wiki", name, "1.0.0"),
            container: ContainerCreate {
                name: name.to_owned(),
                hostname: name.to_owned(),
                image: ImageId::new(""),
                ports: Vec::new(),
                mounts: Vec::new(),
                env: BTreeMap::new(),
                network: NetworkMode::Default,
            },
            source,
        }
    }

    fn pull(reference: &str) -> ImageSource {
        ImageSource::Pull {
            reference: reference.to_owned(),
        }
    }

    fn coordinator(
        dir: &Path,
    ) -> (Arc<MockDriver>, Arc<StaticTransport>, BuildCoordinator) {
        let driver = Arc::new(MockDriver::with_root(dir.join("engine")));
        let transport = Arc::new(StaticTransport::new());
        let manifests = Arc::new(ManifestClient::new(
            "mem://repository.json",
            transport.clone(),
        ));
        let coordinator = BuildCoordinator::new(driver.clone(), manifests, dir.join("cache"));
        (driver, transport, coordinator)
    }

    #[test]
    fn image_tag_is_lowercase() {
        assert_eq!(image_tag("Wiki", "App", "1.2.0"), "berth/wiki_app:1.2.0");
    }

    #[test]
    fn pulls_and_creates_every_container() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, _transport, coordinator) = coordinator(dir.path());
        let outcome = coordinator.run(vec![
            job("db", pull("mariadb:10.6")),
            job("cache", pull("redis:latest")),
            job("web", pull("nginx:latest")),
        ]);
        assert!(outcome.is_complete(3));
        assert!(outcome.failures.is_empty());
        assert_eq!(driver.call_count("pull_image"), 3);
        assert_eq!(driver.call_count("create_container"), 3);
        let (_, web) = driver.container_named("web").unwrap();
        assert!(!web.running);
    }

    #[test]
    fn one_failing_acquisition_leaves_n_minus_one_results() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, _transport, coordinator) = coordinator(dir.path());
        driver.fail_pull("broken:latest");
        let outcome = coordinator.run(vec![
            job("a", pull("nginx:latest")),
            job("b", pull("broken:latest")),
            job("c", pull("redis:latest")),
        ]);
        assert_eq!(outcome.built.len(), 2);
        assert!(!outcome.is_complete(3));
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].0, "b");
        assert!(driver.container_named("b").is_none());
    }

    #[test]
    fn builds_from_source_archive_and_cleans_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, transport, coordinator) = coordinator(dir.path());
        transport.insert("mem://web.tar.gz", source_tarball(true));
        let outcome = coordinator.run(vec![job(
            "web",
            ImageSource::Build {
                url: "mem://web.tar.gz".to_owned(),
            },
        )]);
        assert!(outcome.is_complete(1), "{:?}", outcome.failures);
        assert_eq!(driver.call_count("build_image"), 1);
        assert!(driver
            .calls()
            .contains(&"build_image berth/wiki_web:1.0.0".to_owned()));
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("cache")).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn build_failure_maps_to_builderror() {
        let dir = tempfile::tempdir().unwrap();
        let (_driver, transport, coordinator) = coordinator(dir.path());
        transport.insert("mem://web.tar.gz", source_tarball(false));
        let outcome = coordinator.run(vec![job(
            "web",
            ImageSource::Build {
                url: "mem://web.tar.gz".to_owned(),
            },
        )]);
        assert!(outcome.built.is_empty());
        let (_, err) = &outcome.failures[0];
        assert_eq!(err.status(), berth_store::ServiceStatus::Builderror);
    }

    #[test]
    fn missing_source_archive_fails_only_that_container() {
        let dir = tempfile::tempdir().unwrap();
        let (_driver, _transport, coordinator) = coordinator(dir.path());
        let outcome = coordinator.run(vec![
            job(
                "web",
                ImageSource::Build {
                    url: "mem://absent.tar.gz".to_owned(),
                },
            ),
            job("db", pull("mariadb:10.6")),
        ]);
        assert_eq!(outcome.built.len(), 1);
        assert_eq!(outcome.built[0].name, "db");
        assert_eq!(outcome.failures.len(), 1);
    }

    #[test]
    fn empty_job_list_is_trivially_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (_driver, _transport, coordinator) = coordinator(dir.path());
        assert!(coordinator.run(Vec::new()).is_complete(0));
    }
}
