/*
 * Image Builder - Kaniko Build Orchestration for CI Image Jobs
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Image Builder - builds the Dockerfile targets of a CI job with kaniko
//!
//! Runs as the test container of the driver pod. The repository, commit and
//! job id come from the prow job spec; what to build comes from the flags.

use anyhow::{Context as _, Result};
use clap::{Parser, ValueEnum};
use image_builder::tasks::config::{
    namespace_from_file, BuildOptions, ControllerConfig, JobSpec, SERVICE_ACCOUNT_NAMESPACE_FILE,
};
use image_builder::tasks::{run_build_controller, Context};
use image_builder::{BuildOrchestrator, KubeCluster, LocalSourceTree, TagPolicy};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "image-builder")]
#[command(about = "Build container images of a CI job with kaniko", long_about = None)]
#[command(version)]
struct Cli {
    /// Secret holding the docker config.json used to push images
    #[arg(long, env = "DOCKER_CONFIG_SECRET")]
    docker_config_secret: String,

    /// Path to the Dockerfile, relative to the build context
    #[arg(long, default_value = "Dockerfile")]
    dockerfile: String,

    /// Build context directory holding variants.yaml
    #[arg(long)]
    context: Option<String>,

    /// Only build this variant of the build context
    #[arg(long)]
    build_variant: Option<String>,

    /// Dockerfile target to build; repeat for more targets
    #[arg(long = "target", required = true)]
    targets: Vec<String>,

    /// Extra kaniko argument; repeat for more arguments
    #[arg(long = "kaniko-arg", allow_hyphen_values = true)]
    kaniko_args: Vec<String>,

    /// Registry images are pushed to
    #[arg(long)]
    registry: String,

    /// Registry for the kaniko layer cache; enables caching
    #[arg(long)]
    cache_registry: Option<String>,

    /// Kaniko executor image
    #[arg(long, default_value = "gcr.io/kaniko-project/executor:v1.8.0")]
    kaniko_image: String,

    /// Tag images with the version from the VERSION file
    #[arg(long)]
    add_version_tag: bool,

    /// Tag images with <version>-<short sha>
    #[arg(long)]
    add_version_sha_tag: bool,

    /// Tag images with vYYYYMMDD-<short sha>
    #[arg(long)]
    add_date_sha_tag: bool,

    /// Tag images with <prefix>-vYYYYMMDD-<short sha>
    #[arg(long = "add-date-sha-tag-with-prefix")]
    date_sha_tag_prefixes: Vec<String>,

    /// Tag images with vYYYYMMDD-<short sha>-<suffix>
    #[arg(long = "add-date-sha-tag-with-suffix")]
    date_sha_tag_suffixes: Vec<String>,

    /// Tag images with a fixed tag
    #[arg(long = "add-fixed-tag")]
    fixed_tags: Vec<String>,

    /// Pass EFFECTIVE_VERSION=<version>-<short sha> as build argument
    #[arg(long)]
    inject_effective_version: bool,

    /// Controller configuration file
    #[arg(long, env = "IMAGE_BUILDER_CONFIG", default_value = "/config/config.yaml")]
    config: PathBuf,

    /// Namespace of the driver pod
    #[arg(long, env = "POD_NAMESPACE")]
    namespace: Option<String>,

    /// Name of the driver pod, defaults to the prow job id
    #[arg(long, env = "DRIVER_POD_NAME")]
    driver_pod: Option<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    fn build_options(&self, job_spec: &JobSpec) -> Result<BuildOptions> {
        let refs = job_spec.refs()?;
        Ok(BuildOptions {
            org: refs.org.clone(),
            repo: refs.repo.clone(),
            head_sha: job_spec.head_sha()?,
            dockerfile: self.dockerfile.clone(),
            context: self.context.clone(),
            build_variant: self.build_variant.clone(),
            targets: self.targets.clone(),
            kaniko_args: self.kaniko_args.clone(),
            registry: self.registry.clone(),
            cache_registry: self.cache_registry.clone(),
            kaniko_image: self.kaniko_image.clone(),
            docker_config_secret: self.docker_config_secret.clone(),
            tags: TagPolicy {
                version_tag: self.add_version_tag,
                version_sha_tag: self.add_version_sha_tag,
                date_sha_tag: self.add_date_sha_tag,
                date_sha_tag_prefixes: self.date_sha_tag_prefixes.clone(),
                date_sha_tag_suffixes: self.date_sha_tag_suffixes.clone(),
                fixed_tags: self.fixed_tags.clone(),
                inject_effective_version: self.inject_effective_version,
            },
        })
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{level},kube=warn").into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn load_config(path: &Path) -> Result<ControllerConfig> {
    let config = if path.exists() {
        let config = ControllerConfig::from_mounted_file(&path.to_string_lossy())?;
        info!(path = %path.display(), "Loaded controller configuration");
        config
    } else {
        info!(path = %path.display(), "No controller configuration file, using defaults");
        ControllerConfig::default()
    };
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli, shutdown: CancellationToken) -> Result<()> {
    let job_spec = JobSpec::from_env()?;
    let options = cli.build_options(&job_spec)?;
    options.validate()?;
    let config = Arc::new(load_config(&cli.config)?);

    let namespace = match cli.namespace {
        Some(namespace) => namespace,
        None => namespace_from_file(Path::new(SERVICE_ACCOUNT_NAMESPACE_FILE))?,
    };
    let driver_name = cli
        .driver_pod
        .unwrap_or_else(|| job_spec.prow_job_id.clone());

    info!(
        org = %options.org,
        repo = %options.repo,
        head_sha = %options.head_sha,
        targets = ?options.targets,
        namespace = %namespace,
        driver = %driver_name,
        "Starting image build"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let source = LocalSourceTree::new(config.repository_root(&options.org, &options.repo));
    let orchestrator = BuildOrchestrator::new(
        Arc::new(KubeCluster::new(client.clone(), &namespace)),
        Arc::new(source),
        options,
        config.clone(),
        namespace,
        driver_name,
    );

    // Cancelling the build token stops the controller loop
    let build_token = orchestrator.shutdown_token();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        build_token.cancel();
    });

    let context = Arc::new(Context::new(config, orchestrator));
    run_build_controller(client, context).await?;
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            warn!("Received Ctrl+C, interrupting build");
        },
        () = terminate => {
            warn!("Received SIGTERM, interrupting build");
        },
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    match run(cli, shutdown).await {
        Ok(()) => {
            info!("Build successful");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Build failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
