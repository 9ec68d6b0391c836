//! Container engine drivers for berth.
//!
//! The orchestrator only talks to the engine through [`RuntimeDriver`]. Two
//! drivers exist: [`DockerDriver`], which shells out to the `docker` CLI, and
//! [`MockDriver`], an in-memory engine that records every call and can be told
//! to fail specific operations.

pub mod docker;
pub mod driver;
pub mod mock;
pub mod prereq;

pub use docker::DockerDriver;
pub use driver::{select_driver, ContainerCreate, Mount, MountSource, NetworkMode, RuntimeDriver};
pub use mock::MockDriver;
pub use prereq::{check_docker_prereqs, format_missing, MissingPrereq};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("driver '{0}' is not available on this system")]
    DriverUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("container engine error: {0}")]
    Engine(String),
    #[error("image build failed: {0}")]
    Build(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinguishable() {
        assert!(RuntimeError::NotFound("container abc".into()).is_not_found());
        assert!(!RuntimeError::Engine("conflict".into()).is_not_found());
        assert!(!RuntimeError::Build("step 3".into()).is_not_found());
    }

    #[test]
    fn error_messages_name_the_object() {
        let e = RuntimeError::DriverUnavailable("podman".into());
        assert!(e.to_string().contains("podman"));
    }
}
