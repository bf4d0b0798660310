use crate::tasks::build::BuildOrchestrator;
use crate::tasks::config::ControllerConfig;
use std::path::PathBuf;
use std::sync::Arc;

// Error type for the build controller
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Head SHA '{sha}' is not a valid commit SHA")]
    InvalidSha { sha: String },

    #[error("No version in version file {}", path.display())]
    EmptyVersionFile { path: PathBuf },

    #[error("Failed to read version file {}: {source}", path.display())]
    VersionFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Driver pod {namespace}/{name} not found")]
    DriverNotFound { namespace: String, name: String },

    #[error("No {container} init container with {env} variable in driver pod")]
    MissingCloneConfig { container: String, env: String },

    #[error("Kubernetes error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Started build pods not found: {}", units.join(", "))]
    StartedUnitsMissing { units: Vec<String> },

    #[error("Build pods ended in phase failed: {}", units.join(", "))]
    UnitsFailed { units: Vec<String> },

    #[error("Build interrupted before all build pods finished")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether another reconcile tick can possibly clear the error.
    ///
    /// Invalid input and malformed version metadata are deterministic, so
    /// they end the build on first sight. Everything that depends on
    /// cluster state is retried within the error budget.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::ConfigError(_)
                | Error::InvalidSha { .. }
                | Error::EmptyVersionFile { .. }
                | Error::VersionFileRead { .. }
                | Error::UnitsFailed { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// Context for the build controller
pub struct Context {
    pub namespace: String,
    pub driver_name: String,
    pub config: Arc<ControllerConfig>,
    pub orchestrator: BuildOrchestrator,
}

impl Context {
    #[must_use]
    pub fn new(config: Arc<ControllerConfig>, orchestrator: BuildOrchestrator) -> Self {
        Self {
            namespace: orchestrator.namespace().to_string(),
            driver_name: orchestrator.driver_name().to_string(),
            config,
            orchestrator,
        }
    }
}
