use crate::tasks::build::logs::collect_unit_logs;
use crate::tasks::build::plan::{BuildPlan, BuildPlanner};
use crate::tasks::build::resources::BuildResources;
use crate::tasks::build::state::{BuildState, NextAction, UnitPhase};
use crate::tasks::cluster::{ClusterApi, CreateOutcome};
use crate::tasks::config::{BuildOptions, ControllerConfig};
use crate::tasks::source::SourceTree;
use crate::tasks::types::{Error, Result};
use chrono::{NaiveDate, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Point-in-time view of a build, for logging and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSnapshot {
    pub planned_units: Vec<String>,
    pub phases: BTreeMap<String, UnitPhase>,
    pub error_count: u32,
    pub terminated: bool,
}

/// Drives the build pods of one driver pod to completion
///
/// Every reconcile tick re-reads the cluster, records phase changes and
/// starts the next group once the previous one succeeded. Ticks are
/// serialized on the build state, so overlapping triggers never create
/// pods twice.
pub struct BuildOrchestrator {
    cluster: Arc<dyn ClusterApi>,
    source: Arc<dyn SourceTree>,
    options: BuildOptions,
    config: Arc<ControllerConfig>,
    namespace: String,
    driver_name: String,
    build_date: Option<NaiveDate>,
    state: Mutex<BuildState>,
    shutdown: CancellationToken,
}

impl BuildOrchestrator {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        source: Arc<dyn SourceTree>,
        options: BuildOptions,
        config: Arc<ControllerConfig>,
        namespace: impl Into<String>,
        driver_name: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            source,
            options,
            config,
            namespace: namespace.into(),
            driver_name: driver_name.into(),
            build_date: None,
            state: Mutex::new(BuildState::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Pin the date used in date tags instead of the current UTC date
    #[must_use]
    pub fn with_build_date(mut self, date: NaiveDate) -> Self {
        self.build_date = Some(date);
        self
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Cancelled once the build terminated; cancel it to interrupt the build
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn is_terminated(&self) -> bool {
        self.state.lock().await.is_terminated()
    }

    /// Outcome of a terminated build, handed out once
    pub async fn take_outcome(&self) -> Option<Result<()>> {
        self.state.lock().await.take_outcome()
    }

    pub async fn snapshot(&self) -> BuildSnapshot {
        let state = self.state.lock().await;
        BuildSnapshot {
            planned_units: state
                .plan()
                .map(|plan| plan.units().iter().map(|u| u.name.clone()).collect())
                .unwrap_or_default(),
            phases: state
                .phases()
                .iter()
                .map(|(name, phase)| (name.clone(), *phase))
                .collect(),
            error_count: state.error_count(),
            terminated: state.is_terminated(),
        }
    }

    /// Run one reconcile tick within the error budget
    ///
    /// Errors that a later tick cannot clear end the build at once. Other
    /// errors are returned for a retry until more than `max_errors` ticks
    /// in a row failed.
    #[instrument(skip(self), fields(namespace = %self.namespace, driver = %self.driver_name))]
    pub async fn reconcile(&self) -> Result<Action> {
        let mut state = self.state.lock().await;
        if state.is_terminated() {
            return Ok(Action::await_change());
        }

        match self.tick(&mut state).await {
            Ok(()) => {
                state.reset_errors();
                if state.is_terminated() {
                    Ok(Action::await_change())
                } else {
                    Ok(Action::requeue(self.config.requeue_interval()))
                }
            }
            Err(err) if !err.is_retryable() => {
                error!(error = %err, "Build cannot proceed");
                self.terminate(&mut state, Err(err));
                Ok(Action::await_change())
            }
            Err(err) => {
                let errors = state.record_error();
                if errors > self.config.max_errors {
                    error!(error = %err, errors, "Too many errors, stopping build");
                    self.terminate(&mut state, Err(err));
                    Ok(Action::await_change())
                } else {
                    warn!(error = %err, errors, max_errors = self.config.max_errors, "Reconcile failed");
                    Err(err)
                }
            }
        }
    }

    fn terminate(&self, state: &mut BuildState, outcome: Result<()>) {
        if state.terminate(outcome) {
            self.shutdown.cancel();
        }
    }

    async fn tick(&self, state: &mut BuildState) -> Result<()> {
        let driver = self
            .cluster
            .get_pod(&self.driver_name)
            .await?
            .ok_or_else(|| Error::DriverNotFound {
                namespace: self.namespace.clone(),
                name: self.driver_name.clone(),
            })?;

        if state.plan().is_none() {
            self.ensure_volume_claim(&driver).await?;
            let plan = self.define_plan(&driver)?;
            info!(
                units = plan.len(),
                groups = plan.groups().len(),
                "Build pods defined"
            );
            state.set_plan(plan);
        }

        let owner_uid = driver.uid().unwrap_or_default();
        let pods = self.cluster.list_owned_pods(&owner_uid).await?;

        let mut listed = HashSet::with_capacity(pods.len());
        for pod in &pods {
            let name = pod.name_any();
            let phase = UnitPhase::from_pod(pod);
            if let Some(transition) = state.observe(&name, phase) {
                info!(pod = %name, phase = %transition.to, "Build pod phase changed");
                if transition.to.is_terminal() {
                    self.collect_logs(transition.index, &name).await;
                }
            }
            listed.insert(name);
        }

        match state.next_action(&listed) {
            NextAction::Wait => {
                debug!(pods = listed.len(), "Waiting for build pods");
            }
            NextAction::StartGroup(range) => self.start_group(state, range).await?,
            NextAction::Abort { failed } => {
                error!(failed = ?failed, "Build pods failed, not starting further builds");
                self.terminate(state, Err(Error::UnitsFailed { units: failed }));
            }
            NextAction::Missing { units } => {
                return Err(Error::StartedUnitsMissing { units });
            }
            NextAction::Complete => {
                info!("All build pods succeeded");
                self.terminate(state, Ok(()));
            }
        }

        Ok(())
    }

    fn define_plan(&self, driver: &Pod) -> Result<BuildPlan> {
        let date = self.build_date.unwrap_or_else(|| Utc::now().date_naive());
        BuildPlanner::new(&self.options, &self.config, self.source.as_ref(), date).build(driver)
    }

    async fn ensure_volume_claim(&self, driver: &Pod) -> Result<()> {
        let resources = BuildResources::new(driver, &self.options, &self.config);
        let name = resources.volume_claim_name();

        if self.cluster.get_volume_claim(&name).await?.is_some() {
            debug!(claim = %name, "PVC already exists");
            return Ok(());
        }

        match self
            .cluster
            .create_volume_claim(&resources.volume_claim())
            .await?
        {
            CreateOutcome::Created => info!(claim = %name, "Created PVC"),
            CreateOutcome::AlreadyExists => debug!(claim = %name, "PVC created concurrently"),
        }
        Ok(())
    }

    async fn start_group(&self, state: &mut BuildState, range: Range<usize>) -> Result<()> {
        let Some(plan) = state.plan() else {
            return Ok(());
        };
        let group = plan.units()[range.start].group.clone();
        let pending: Vec<_> = plan.units()[range.clone()]
            .iter()
            .filter(|unit| state.phase(&unit.name).is_none())
            .map(|unit| (unit.name.clone(), unit.pod.clone()))
            .collect();

        info!(%group, pods = pending.len(), "Starting build group");
        state.begin_group(range);

        for (name, pod) in pending {
            match self.cluster.create_pod(&pod).await? {
                CreateOutcome::Created => info!(pod = %name, "Created build pod"),
                CreateOutcome::AlreadyExists => debug!(pod = %name, "Build pod already exists"),
            }
            state.record_started(&name);
        }
        Ok(())
    }

    async fn collect_logs(&self, index: usize, pod_name: &str) {
        match collect_unit_logs(
            self.cluster.as_ref(),
            &self.config.artifact_directory,
            index,
            pod_name,
        )
        .await
        {
            Ok(path) => info!(pod = %pod_name, path = %path.display(), "Saved build logs"),
            Err(e) => warn!(pod = %pod_name, error = %e, "Failed to save build logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::build::resources::tests::{build_options, driver_pod};
    use crate::tasks::build::tags::TagPolicy;
    use crate::tasks::cluster::LogStream;
    use crate::tasks::source::MockSourceTree;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodStatus};
    use kube::core::ErrorResponse;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeState {
        driver: Option<Pod>,
        pods: BTreeMap<String, Pod>,
        claims: Vec<String>,
        created: Vec<String>,
        failures_left: u32,
        fail_logs: bool,
        reject_create: Option<String>,
    }

    /// In-memory cluster; pod phases are set by the test
    #[derive(Default)]
    struct FakeCluster {
        state: StdMutex<FakeState>,
    }

    impl FakeCluster {
        fn with_driver() -> Arc<Self> {
            let cluster = Self::default();
            cluster.state.lock().unwrap().driver = Some(driver_pod());
            Arc::new(cluster)
        }

        fn set_phase(&self, name: &str, phase: &str) {
            let mut state = self.state.lock().unwrap();
            let pod = state.pods.get_mut(name).unwrap();
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            });
        }

        fn set_all_phases(&self, phase: &str) {
            let names: Vec<_> = self.state.lock().unwrap().pods.keys().cloned().collect();
            for name in names {
                self.set_phase(&name, phase);
            }
        }

        fn created(&self) -> Vec<String> {
            self.state.lock().unwrap().created.clone()
        }

        fn fail_next(&self, times: u32) {
            self.state.lock().unwrap().failures_left = times;
        }

        fn check_failure(&self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(Error::KubeError(kube::Error::Api(ErrorResponse {
                    status: "Failure".to_string(),
                    message: "etcdserver: request timed out".to_string(),
                    reason: "InternalError".to_string(),
                    code: 500,
                })));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ClusterApi for FakeCluster {
        async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
            self.check_failure()?;
            let state = self.state.lock().unwrap();
            Ok(state
                .driver
                .clone()
                .filter(|driver| driver.name_any() == name))
        }

        async fn list_owned_pods(&self, owner_uid: &str) -> Result<Vec<Pod>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .pods
                .values()
                .filter(|pod| {
                    pod.owner_references()
                        .iter()
                        .any(|owner| owner.uid == owner_uid)
                })
                .cloned()
                .collect())
        }

        async fn create_pod(&self, pod: &Pod) -> Result<CreateOutcome> {
            let mut state = self.state.lock().unwrap();
            let name = pod.name_any();
            if state.reject_create.as_deref() == Some(name.as_str()) {
                state.reject_create = None;
                return Err(Error::KubeError(kube::Error::Api(ErrorResponse {
                    status: "Failure".to_string(),
                    message: "etcdserver: leader changed".to_string(),
                    reason: "InternalError".to_string(),
                    code: 500,
                })));
            }
            if state.pods.contains_key(&name) {
                return Ok(CreateOutcome::AlreadyExists);
            }
            state.created.push(name.clone());
            state.pods.insert(name, pod.clone());
            Ok(CreateOutcome::Created)
        }

        async fn get_volume_claim(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .claims
                .iter()
                .any(|claim| claim == name)
                .then(PersistentVolumeClaim::default))
        }

        async fn create_volume_claim(&self, claim: &PersistentVolumeClaim) -> Result<CreateOutcome> {
            self.state.lock().unwrap().claims.push(claim.name_any());
            Ok(CreateOutcome::Created)
        }

        async fn stream_logs(&self, pod_name: &str) -> Result<LogStream> {
            if self.state.lock().unwrap().fail_logs {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "log stream closed",
                )));
            }
            let logs = format!("building {pod_name}\ndone\n").into_bytes();
            Ok(Box::pin(futures::io::Cursor::new(logs)))
        }
    }

    fn orchestrator(
        cluster: Arc<FakeCluster>,
        options: BuildOptions,
        artifacts: &std::path::Path,
    ) -> BuildOrchestrator {
        let config = ControllerConfig {
            artifact_directory: artifacts.to_path_buf(),
            max_errors: 2,
            ..ControllerConfig::default()
        };
        let mut source = MockSourceTree::new();
        source
            .expect_read_to_string()
            .returning(|_| Ok("1.0.0\n".to_string()));

        BuildOrchestrator::new(
            cluster,
            Arc::new(source),
            options,
            Arc::new(config),
            "test-pods",
            "prow-job-image-build-pod",
        )
        .with_build_date(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap())
    }

    #[tokio::test]
    async fn successful_build_runs_groups_in_order() {
        let artifacts = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::with_driver();
        let orchestrator = orchestrator(cluster.clone(), build_options(), artifacts.path());

        let action = orchestrator.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        assert_eq!(
            cluster.created(),
            vec!["prow-job-image-build-pod-git-repo-clonerefs"]
        );
        assert_eq!(
            cluster.state.lock().unwrap().claims,
            vec!["prow-job-image-build-pod"]
        );

        cluster.set_all_phases("Succeeded");
        orchestrator.reconcile().await.unwrap();
        assert_eq!(cluster.created().len(), 2);

        cluster.set_all_phases("Succeeded");
        orchestrator.reconcile().await.unwrap();
        assert_eq!(cluster.created().len(), 4);

        cluster.set_all_phases("Succeeded");
        let action = orchestrator.reconcile().await.unwrap();
        assert_eq!(action, Action::await_change());

        assert!(orchestrator.is_terminated().await);
        assert!(orchestrator.shutdown_token().is_cancelled());
        assert!(matches!(orchestrator.take_outcome().await, Some(Ok(()))));

        let log = artifacts
            .path()
            .join("003-prow-job-image-build-pod-git-repo-target3-build-log.txt");
        assert_eq!(
            std::fs::read_to_string(log).unwrap(),
            "building prow-job-image-build-pod-git-repo-target3\ndone\n"
        );
    }

    #[tokio::test]
    async fn repeated_ticks_do_not_duplicate_pods() {
        let artifacts = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::with_driver();
        let orchestrator = orchestrator(cluster.clone(), build_options(), artifacts.path());

        orchestrator.reconcile().await.unwrap();
        cluster.set_all_phases("Running");
        orchestrator.reconcile().await.unwrap();
        orchestrator.reconcile().await.unwrap();

        assert_eq!(cluster.created().len(), 1);
        assert!(!orchestrator.is_terminated().await);
    }

    #[tokio::test]
    async fn failed_group_stops_build() {
        let artifacts = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::with_driver();
        let options = BuildOptions {
            cache_registry: None,
            ..build_options()
        };
        let orchestrator = orchestrator(cluster.clone(), options, artifacts.path());

        orchestrator.reconcile().await.unwrap();
        cluster.set_all_phases("Succeeded");
        orchestrator.reconcile().await.unwrap();
        assert_eq!(cluster.created().len(), 4);

        cluster.set_phase("prow-job-image-build-pod-git-repo-target1", "Failed");
        cluster.set_phase("prow-job-image-build-pod-git-repo-target2", "Running");
        orchestrator.reconcile().await.unwrap();
        assert!(!orchestrator.is_terminated().await);

        cluster.set_phase("prow-job-image-build-pod-git-repo-target2", "Succeeded");
        cluster.set_phase("prow-job-image-build-pod-git-repo-target3", "Succeeded");
        orchestrator.reconcile().await.unwrap();

        let outcome = orchestrator.take_outcome().await.unwrap();
        match outcome {
            Err(Error::UnitsFailed { units }) => {
                assert_eq!(units, vec!["prow-job-image-build-pod-git-repo-target1"]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_during_partial_group_creation_stops_build() {
        let artifacts = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::with_driver();
        let options = BuildOptions {
            cache_registry: None,
            ..build_options()
        };
        let orchestrator = orchestrator(cluster.clone(), options, artifacts.path());

        orchestrator.reconcile().await.unwrap();
        cluster.set_all_phases("Succeeded");
        cluster.state.lock().unwrap().reject_create =
            Some("prow-job-image-build-pod-git-repo-target2".to_string());
        assert!(orchestrator.reconcile().await.is_err());
        assert_eq!(cluster.created().len(), 2);

        cluster.set_phase("prow-job-image-build-pod-git-repo-target1", "Failed");
        orchestrator.reconcile().await.unwrap();
        orchestrator.reconcile().await.unwrap();

        assert_eq!(
            cluster.created(),
            vec![
                "prow-job-image-build-pod-git-repo-clonerefs",
                "prow-job-image-build-pod-git-repo-target1",
            ]
        );
        assert!(matches!(
            orchestrator.take_outcome().await,
            Some(Err(Error::UnitsFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn failed_cache_build_skips_remaining_groups() {
        let artifacts = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::with_driver();
        let orchestrator = orchestrator(cluster.clone(), build_options(), artifacts.path());

        orchestrator.reconcile().await.unwrap();
        cluster.set_all_phases("Succeeded");
        orchestrator.reconcile().await.unwrap();
        cluster.set_phase("prow-job-image-build-pod-git-repo-target1", "Failed");
        orchestrator.reconcile().await.unwrap();
        orchestrator.reconcile().await.unwrap();

        assert_eq!(cluster.created().len(), 2);
        assert!(orchestrator.is_terminated().await);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_within_budget() {
        let artifacts = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::with_driver();
        let orchestrator = orchestrator(cluster.clone(), build_options(), artifacts.path());

        cluster.fail_next(2);
        assert!(orchestrator.reconcile().await.is_err());
        assert!(orchestrator.reconcile().await.is_err());
        assert_eq!(orchestrator.snapshot().await.error_count, 2);

        orchestrator.reconcile().await.unwrap();
        let snapshot = orchestrator.snapshot().await;
        assert_eq!(snapshot.error_count, 0);
        assert!(!snapshot.terminated);
        assert_eq!(snapshot.planned_units.len(), 4);
    }

    #[tokio::test]
    async fn error_budget_exhaustion_stops_build() {
        let artifacts = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::with_driver();
        let orchestrator = orchestrator(cluster.clone(), build_options(), artifacts.path());

        cluster.fail_next(10);
        assert!(orchestrator.reconcile().await.is_err());
        assert!(orchestrator.reconcile().await.is_err());
        let action = orchestrator.reconcile().await.unwrap();
        assert_eq!(action, Action::await_change());

        assert!(orchestrator.shutdown_token().is_cancelled());
        assert!(matches!(
            orchestrator.take_outcome().await,
            Some(Err(Error::KubeError(_)))
        ));
        assert!(cluster.created().is_empty());
    }

    #[tokio::test]
    async fn invalid_version_metadata_stops_build_at_once() {
        let artifacts = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::with_driver();
        let options = BuildOptions {
            head_sha: "abc".to_string(),
            ..build_options()
        };
        let orchestrator = orchestrator(cluster.clone(), options, artifacts.path());

        orchestrator.reconcile().await.unwrap();
        assert!(matches!(
            orchestrator.take_outcome().await,
            Some(Err(Error::InvalidSha { .. }))
        ));
        assert!(cluster.created().is_empty());
    }

    #[tokio::test]
    async fn missing_driver_is_retried() {
        let artifacts = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::default());
        let orchestrator = orchestrator(cluster, build_options(), artifacts.path());

        let err = orchestrator.reconcile().await.unwrap_err();
        assert!(matches!(err, Error::DriverNotFound { .. }));
        assert!(!orchestrator.is_terminated().await);
    }

    #[tokio::test]
    async fn log_failures_do_not_fail_the_build() {
        let artifacts = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::with_driver();
        cluster.state.lock().unwrap().fail_logs = true;
        let options = BuildOptions {
            targets: vec!["target1".to_string()],
            cache_registry: None,
            tags: TagPolicy {
                fixed_tags: vec!["latest".to_string()],
                ..TagPolicy::default()
            },
            ..build_options()
        };
        let orchestrator = orchestrator(cluster.clone(), options, artifacts.path());

        for _ in 0..3 {
            orchestrator.reconcile().await.unwrap();
            cluster.set_all_phases("Succeeded");
        }

        assert!(matches!(orchestrator.take_outcome().await, Some(Ok(()))));
        assert_eq!(std::fs::read_dir(artifacts.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn terminated_build_ignores_further_ticks() {
        let artifacts = tempfile::tempdir().unwrap();
        let cluster = FakeCluster::with_driver();
        let options = BuildOptions {
            head_sha: "abc".to_string(),
            ..build_options()
        };
        let orchestrator = orchestrator(cluster.clone(), options, artifacts.path());

        orchestrator.reconcile().await.unwrap();
        cluster.fail_next(1);
        assert_eq!(
            orchestrator.reconcile().await.unwrap(),
            Action::await_change()
        );
        assert_eq!(cluster.state.lock().unwrap().failures_left, 1);
    }
}
