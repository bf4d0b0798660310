use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, Instrument};

pub mod build;
pub mod cluster;
pub mod config;
pub mod source;
pub mod types;

// Re-export commonly used items
pub use build::BuildOrchestrator;
pub use config::{BuildOptions, ControllerConfig};
pub use types::{Context, Error, Result};

/// Watch the driver pod and the build pods it owns until the build ends
///
/// Returns the build outcome once the orchestrator terminated, or
/// [`Error::Interrupted`] when the shutdown token was cancelled first.
#[instrument(skip(client, context), fields(namespace = %context.namespace, driver = %context.driver_name))]
pub async fn run_build_controller(client: Client, context: Arc<Context>) -> Result<()> {
    info!("Starting build controller");

    let pods: Api<Pod> = Api::namespaced(client, &context.namespace);
    let driver_config = Config::default()
        .fields(&format!("metadata.name={}", context.driver_name))
        .any_semantic();
    let shutdown = context.orchestrator.shutdown_token();

    Controller::new(pods.clone(), driver_config)
        .owns(pods, Config::default().any_semantic())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile_build, error_policy, context.clone())
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("build_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(driver) => {
                        debug!(resource = ?driver, "Build reconciliation finished");
                    }
                    Err(reconciliation_err) => {
                        debug!(error = ?reconciliation_err, "Build reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("Build controller shutting down");
    context
        .orchestrator
        .take_outcome()
        .await
        .unwrap_or(Err(Error::Interrupted))
}

#[instrument(skip(pod, ctx), fields(pod = %pod.name_any()))]
async fn reconcile_build(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action> {
    if pod.name_any() != ctx.driver_name {
        debug!("Ignoring pod that is not the driver");
        return Ok(Action::await_change());
    }
    ctx.orchestrator.reconcile().await
}

/// Failed ticks are retried after the regular interval
fn error_policy(pod: Arc<Pod>, err: &Error, ctx: Arc<Context>) -> Action {
    error!(
        error = %err,
        pod = %pod.name_any(),
        "Build reconciliation failed, retrying"
    );
    Action::requeue(ctx.config.requeue_interval())
}
