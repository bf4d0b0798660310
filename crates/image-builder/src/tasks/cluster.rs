//! Cluster operations the build orchestrator depends on.

use crate::tasks::types::Result;
use async_trait::async_trait;
use futures::io::AsyncBufRead;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, ListParams, LogParams, PostParams};
use kube::Client;
use std::pin::Pin;
use tracing::debug;

/// Pod logs as they are read from the cluster
pub type LogStream = Pin<Box<dyn AsyncBufRead + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// An object with the same name exists; creation is idempotent
    AlreadyExists,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>>;

    /// Pods whose owner references include `owner_uid`
    async fn list_owned_pods(&self, owner_uid: &str) -> Result<Vec<Pod>>;

    async fn create_pod(&self, pod: &Pod) -> Result<CreateOutcome>;

    async fn get_volume_claim(&self, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    async fn create_volume_claim(&self, claim: &PersistentVolumeClaim) -> Result<CreateOutcome>;

    async fn stream_logs(&self, pod_name: &str) -> Result<LogStream>;
}

/// [`ClusterApi`] backed by the Kubernetes API of one namespace
#[derive(Clone)]
pub struct KubeCluster {
    pods: Api<Pod>,
    claims: Api<PersistentVolumeClaim>,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            claims: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods.get_opt(name).await?)
    }

    async fn list_owned_pods(&self, owner_uid: &str) -> Result<Vec<Pod>> {
        let pods = self.pods.list(&ListParams::default()).await?;
        Ok(pods
            .items
            .into_iter()
            .filter(|pod| {
                pod.metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|owners| owners.iter().any(|owner| owner.uid == owner_uid))
            })
            .collect())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<CreateOutcome> {
        match self.pods.create(&PostParams::default(), pod).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(pod = ?pod.metadata.name, "Pod already exists");
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_volume_claim(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.claims.get_opt(name).await?)
    }

    async fn create_volume_claim(&self, claim: &PersistentVolumeClaim) -> Result<CreateOutcome> {
        match self.claims.create(&PostParams::default(), claim).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(claim = ?claim.metadata.name, "PVC already exists");
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stream_logs(&self, pod_name: &str) -> Result<LogStream> {
        let logs = self
            .pods
            .log_stream(pod_name, &LogParams::default())
            .await?;
        Ok(Box::pin(logs))
    }
}
