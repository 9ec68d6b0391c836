//! Service lifecycle orchestration for berth.
//!
//! A [`Service`] owns one service's state machine: it fetches versioned
//! manifests, provisions networks and volumes, fans container builds out
//! through the [`BuildCoordinator`], and persists every step to the service's
//! `config.json`. [`Fleet`] keys all services by name and is what the HTTP
//! control surface and the CLI drive. Long operations run on a background
//! thread per service; callers poll [`Service::status`].

pub mod build;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod fleet;
pub mod lifecycle;
pub mod secret;
pub mod service;

pub use build::{BuildCoordinator, BuildJob, BuildOutcome, BuiltContainer};
pub use concurrency::{install_signal_handler, shutdown_requested, StoreLock};
pub use config::AgentConfig;
pub use context::{AgentContext, NetworkRegistry};
pub use fleet::{
    ActionResult, AvailableEntry, EnvUpdate, Fleet, ServiceReport, UpdateCheck,
};
pub use lifecycle::validate_transition;
pub use secret::random_string;
pub use service::{RequiredVariable, RequiredVariables, Service};

use berth_store::ServiceStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("description error: {0}")]
    Description(#[from] berth_schema::DescriptionError),
    #[error("store error: {0}")]
    Store(#[from] berth_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] berth_runtime::RuntimeError),
    #[error("remote error: {0}")]
    Remote(#[from] berth_remote::RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    #[error("service already installed: {0}")]
    ServiceExists(String),
    #[error("no installable version of service '{0}'")]
    NotAvailable(String),
    #[error("service '{0}' is essential and cannot be deleted")]
    Essential(String),
    #[error("service '{0}' cannot be reverted")]
    RevertNotAllowed(String),
    #[error("service '{0}' is busy with another operation")]
    Busy(String),
    #[error("built {built} of {expected} containers")]
    IncompleteBuild { expected: usize, built: usize },
    #[error("environment variables without a value: {}", .0.join(", "))]
    MissingVariables(Vec<String>),
    #[error("service '{0}' is already at version {1}")]
    SameVersion(String, String),
    #[error("service '{0}' has no installed description")]
    NoDescription(String),
    #[error("agent is already set up")]
    AlreadySetUp,
}

impl CoreError {
    /// Status a service is left in when an operation fails with this error.
    pub fn status(&self) -> ServiceStatus {
        match self {
            CoreError::Runtime(e) if e.is_not_found() => ServiceStatus::Inaccessible,
            CoreError::Runtime(berth_runtime::RuntimeError::Build(_))
            | CoreError::IncompleteBuild { .. } => ServiceStatus::Builderror,
            _ => ServiceStatus::Error,
        }
    }

    /// Error marker reported by the control surface.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ServiceNotFound(_) => "ERR_SERVICE_NOT_FOUND",
            CoreError::Essential(_) => "ERR_IS_ESSENTIAL",
            CoreError::RevertNotAllowed(_) => "ERR_REVERT_NOT_ALLOWED",
            CoreError::NotAvailable(_)
            | CoreError::Remote(berth_remote::RemoteError::UnknownService(_)) => {
                "ERR_SERVICE_NOT_AVAILABLE"
            }
            CoreError::Busy(_) => "ERR_BUSY",
            CoreError::MissingVariables(_) => "ERR_MISSING_VARIABLES",
            CoreError::InvalidTransition { .. }
            | CoreError::ServiceExists(_)
            | CoreError::SameVersion(..)
            | CoreError::NoDescription(_)
            | CoreError::AlreadySetUp => "ERR_INVALID_STATE",
            _ => "ERR_INTERNAL",
        }
    }
}
