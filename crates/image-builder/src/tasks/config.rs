//! Build Controller Configuration
//!
//! Two layers feed the controller:
//! - [`BuildOptions`]: what to build, taken from command-line flags and the
//!   prow job spec of the driver pod.
//! - [`ControllerConfig`]: how to run builds in this cluster, loaded from an
//!   optional mounted YAML file and falling back to defaults.

use crate::tasks::build::tags::TagPolicy;
use crate::tasks::types::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the prow job spec of the driver pod
pub const JOB_SPEC_ENV: &str = "JOB_SPEC";

/// Namespace of the running pod, mounted with its service account token
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Kaniko arguments owned by dedicated options, with the option to use instead
const RESERVED_KANIKO_ARGS: &[(&str, &str)] = &[
    ("--cache=", "please use --cache-registry option to enable/disable cache"),
    ("--cache-repo=", "please use --cache-registry option to enable/disable cache"),
    (
        "--destination=",
        "please use --registry, --target and --add-[xyz]-tag options to define targets and destinations",
    ),
    (
        "--target=",
        "please use --registry, --target and --add-[xyz]-tag options to define targets and destinations",
    ),
    (
        "--dockerfile=",
        "please use --dockerfile option to define the path to the dockerfile",
    ),
];

/// Everything needed to describe one image build
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Git organization of the repository being built
    pub org: String,
    /// Git repository being built
    pub repo: String,
    /// Commit the build is tagged with
    pub head_sha: String,
    /// Dockerfile path, relative to the build context
    pub dockerfile: String,
    /// Build context holding `variants.yaml`; enables variant mode
    pub context: Option<String>,
    /// Restrict variant mode to a single variant
    pub build_variant: Option<String>,
    /// Dockerfile targets, built in this order
    pub targets: Vec<String>,
    /// Extra kaniko arguments appended to every build
    pub kaniko_args: Vec<String>,
    /// Registry images are pushed to
    pub registry: String,
    /// Registry for kaniko layer cache; `None` disables caching
    pub cache_registry: Option<String>,
    /// Kaniko executor image
    pub kaniko_image: String,
    /// Secret holding the docker `config.json`
    pub docker_config_secret: String,
    /// Tagging schemes
    pub tags: TagPolicy,
}

impl BuildOptions {
    /// Variant mode is active when a build context is configured
    #[must_use]
    pub fn variant_mode(&self) -> bool {
        self.context.is_some()
    }

    #[must_use]
    pub fn caching_enabled(&self) -> bool {
        self.cache_registry.is_some()
    }

    /// Validate the options before any cluster resource is touched
    pub fn validate(&self) -> Result<()> {
        if self.dockerfile.is_empty() {
            return Err(Error::ConfigError(
                "\"dockerfile\" parameter must not be empty".to_string(),
            ));
        }
        if self.docker_config_secret.is_empty() {
            return Err(Error::ConfigError(
                "\"docker-config-secret\" parameter must not be empty".to_string(),
            ));
        }
        if self.targets.is_empty() {
            return Err(Error::ConfigError(
                "specify at least one \"target\"".to_string(),
            ));
        }
        if self.registry.is_empty() {
            return Err(Error::ConfigError(
                "\"registry\" parameter must not be empty".to_string(),
            ));
        }
        if self.build_variant.is_some() && !self.variant_mode() {
            return Err(Error::ConfigError(
                "\"build-variant\" requires a build \"context\"".to_string(),
            ));
        }

        self.tags.validate(self.variant_mode())?;

        for kaniko_arg in &self.kaniko_args {
            if let Some((_, hint)) = RESERVED_KANIKO_ARGS
                .iter()
                .find(|(prefix, _)| kaniko_arg.starts_with(prefix))
            {
                return Err(Error::ConfigError(format!("{kaniko_arg}: {hint}")));
            }
        }

        Ok(())
    }
}

/// Git refs section of the prow job spec
#[derive(Debug, Clone, Deserialize)]
pub struct Refs {
    pub org: String,
    pub repo: String,
    #[serde(default)]
    pub base_ref: String,
    #[serde(default)]
    pub base_sha: String,
    #[serde(default)]
    pub pulls: Vec<Pull>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pull {
    pub number: u64,
    #[serde(default)]
    pub sha: String,
}

/// Job spec injected into every prow pod through the downward API
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    #[serde(rename = "type", default)]
    pub job_type: String,
    #[serde(default)]
    pub job: String,
    /// Prow names the pod after the job id
    #[serde(rename = "prowjobid")]
    pub prow_job_id: String,
    #[serde(default)]
    pub refs: Option<Refs>,
}

impl JobSpec {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::ConfigError(format!("Unable to parse prow job spec: {e}")))
    }

    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(JOB_SPEC_ENV)
            .map_err(|_| Error::ConfigError(format!("{JOB_SPEC_ENV} is not set")))?;
        Self::from_json(&raw)
    }

    /// Refs of the job; image builds always need them
    pub fn refs(&self) -> Result<&Refs> {
        self.refs
            .as_ref()
            .ok_or_else(|| Error::ConfigError("Unable to find a valid git ref".to_string()))
    }

    /// Commit at the tip of the job: last pull request head, else the base
    pub fn head_sha(&self) -> Result<String> {
        let refs = self.refs()?;
        Ok(refs
            .pulls
            .last()
            .map(|pull| pull.sha.clone())
            .filter(|sha| !sha.is_empty())
            .unwrap_or_else(|| refs.base_sha.clone()))
    }
}

/// Cluster-level settings of the build controller
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Directory receiving one log file per build pod
    #[serde(rename = "artifactDirectory", default = "default_artifact_directory")]
    pub artifact_directory: PathBuf,

    /// Directory the driver pod's clonerefs checks repositories out to
    #[serde(rename = "sourceRoot", default = "default_source_root")]
    pub source_root: PathBuf,

    /// Shared volume configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Fixed delay between reconcile ticks
    #[serde(rename = "requeueSeconds", default = "default_requeue_seconds")]
    pub requeue_seconds: u64,

    /// Consecutive reconcile errors tolerated before the build is stopped
    #[serde(rename = "maxErrors", default = "default_max_errors")]
    pub max_errors: u32,
}

/// Storage configuration for the volume shared by all build pods
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Storage class name (optional, cluster default when unset)
    #[serde(rename = "storageClassName", default)]
    pub storage_class_name: Option<String>,

    /// Size of the shared code volume
    #[serde(rename = "size", default = "default_storage_size")]
    pub size: String,
}

fn default_artifact_directory() -> PathBuf {
    PathBuf::from("/logs/artifacts")
}

fn default_source_root() -> PathBuf {
    PathBuf::from("/home/prow/go/src")
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

fn default_requeue_seconds() -> u64 {
    30
}

fn default_max_errors() -> u32 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_class_name: None,
            size: default_storage_size(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            artifact_directory: default_artifact_directory(),
            source_root: default_source_root(),
            storage: StorageConfig::default(),
            requeue_seconds: default_requeue_seconds(),
            max_errors: default_max_errors(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: ControllerConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }

    /// Validate that configuration has usable values
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.requeue_seconds == 0 {
            return Err(anyhow::anyhow!("requeueSeconds must be greater than zero"));
        }
        if self.storage.size.trim().is_empty() {
            return Err(anyhow::anyhow!("storage.size must not be empty"));
        }
        if !self.artifact_directory.is_absolute() {
            return Err(anyhow::anyhow!(
                "artifactDirectory must be an absolute path, got {}",
                self.artifact_directory.display()
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }

    /// Checkout of `org/repo` below the source root
    #[must_use]
    pub fn repository_root(&self, org: &str, repo: &str) -> PathBuf {
        self.source_root.join("github.com").join(org).join(repo)
    }
}

/// Read the namespace the driver pod runs in
pub fn namespace_from_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::ConfigError(format!("Unable to read namespace from {}: {e}", path.display()))
    })?;
    let namespace = content.trim();
    if namespace.is_empty() {
        return Err(Error::ConfigError(format!(
            "Namespace file {} is empty",
            path.display()
        )));
    }
    Ok(namespace.to_string())
}
