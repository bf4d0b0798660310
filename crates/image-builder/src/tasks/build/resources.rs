use crate::tasks::config::{BuildOptions, ControllerConfig};
use crate::tasks::types::{Error, Result};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EmptyDirVolumeSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodAffinity,
    PodAffinityTerm, PodSpec, ResourceRequirements, SecretVolumeSource, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::ResourceExt;
use std::collections::BTreeMap;

pub const CODE_VOLUME: &str = "code";
pub const DOCKER_CONFIG_VOLUME: &str = "docker-config";
pub const LOGS_VOLUME: &str = "logs";

pub const CLONEREFS_CONTAINER: &str = "clonerefs";
pub const CLONEREFS_ENV: &str = "CLONEREFS_OPTIONS";
pub const KANIKO_CONTAINER: &str = "kaniko";

const CODE_SUB_PATH: &str = "code";
const KANIKO_CONTEXT_PATH: &str = "/code";
const KANIKO_DOCKER_CONFIG_PATH: &str = "/kaniko/.docker";
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Builds the Kubernetes objects of a build from the driver pod
pub struct BuildResources<'a> {
    driver: &'a Pod,
    options: &'a BuildOptions,
    config: &'a ControllerConfig,
}

impl<'a> BuildResources<'a> {
    #[must_use]
    pub fn new(driver: &'a Pod, options: &'a BuildOptions, config: &'a ControllerConfig) -> Self {
        Self {
            driver,
            options,
            config,
        }
    }

    /// The shared code volume is named after the driver pod
    #[must_use]
    pub fn volume_claim_name(&self) -> String {
        self.driver.name_any()
    }

    /// Controller reference to the driver so that build resources are
    /// garbage collected with it
    #[must_use]
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            name: self.driver.name_any(),
            uid: self.driver.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn metadata(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: self.driver.namespace(),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn volume_claim(&self) -> PersistentVolumeClaim {
        let mut requests = BTreeMap::new();
        requests.insert(
            "storage".to_string(),
            Quantity(self.config.storage.size.clone()),
        );

        PersistentVolumeClaim {
            metadata: self.metadata(&self.volume_claim_name()),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: self.config.storage.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Clone pod running the driver's clonerefs init container against the
    /// shared volume
    pub fn clone_pod(&self, name: &str) -> Result<Pod> {
        let init_container = self
            .driver
            .spec
            .as_ref()
            .and_then(|spec| spec.init_containers.as_ref())
            .and_then(|containers| containers.iter().find(|c| c.name == CLONEREFS_CONTAINER));

        let clone_env = init_container
            .and_then(|c| c.env.as_ref())
            .and_then(|env| env.iter().find(|var| var.name == CLONEREFS_ENV));

        let (Some(init_container), Some(clone_env)) = (init_container, clone_env) else {
            return Err(Error::MissingCloneConfig {
                container: CLONEREFS_CONTAINER.to_string(),
                env: CLONEREFS_ENV.to_string(),
            });
        };

        let checkout_path = self
            .config
            .repository_root(&self.options.org, &self.options.repo)
            .display()
            .to_string();

        let container = Container {
            name: init_container.name.clone(),
            image: init_container.image.clone(),
            env: Some(vec![clone_env.clone()]),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: CODE_VOLUME.to_string(),
                    mount_path: checkout_path,
                    sub_path: Some(CODE_SUB_PATH.to_string()),
                    ..Default::default()
                },
                VolumeMount {
                    name: LOGS_VOLUME.to_string(),
                    mount_path: "/logs".to_string(),
                    ..Default::default()
                },
            ]),
            resources: Some(zero_requests()),
            ..Default::default()
        };

        let mut pod = Pod {
            metadata: self.metadata(name),
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![container],
                volumes: Some(vec![Volume {
                    name: LOGS_VOLUME.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.configure(&mut pod);
        Ok(pod)
    }

    /// Kaniko pod building one target
    #[must_use]
    pub fn kaniko_pod(&self, name: &str, args: Vec<String>) -> Pod {
        let container = Container {
            name: KANIKO_CONTAINER.to_string(),
            image: Some(self.options.kaniko_image.clone()),
            args: Some(args),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: CODE_VOLUME.to_string(),
                    mount_path: KANIKO_CONTEXT_PATH.to_string(),
                    sub_path: Some(CODE_SUB_PATH.to_string()),
                    ..Default::default()
                },
                VolumeMount {
                    name: DOCKER_CONFIG_VOLUME.to_string(),
                    mount_path: KANIKO_DOCKER_CONFIG_PATH.to_string(),
                    ..Default::default()
                },
            ]),
            resources: Some(zero_requests()),
            ..Default::default()
        };

        let mut pod = Pod {
            metadata: self.metadata(name),
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![container],
                volumes: Some(vec![Volume {
                    name: DOCKER_CONFIG_VOLUME.to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(self.options.docker_config_secret.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.configure(&mut pod);
        pod
    }

    /// Fixed kaniko arguments of every target build
    #[must_use]
    pub fn kaniko_base_args(dockerfile: &str, target: &str) -> Vec<String> {
        vec![
            "--skip-unused-stages".to_string(),
            format!("--context={KANIKO_CONTEXT_PATH}"),
            format!("--dockerfile={dockerfile}"),
            format!("--target={target}"),
        ]
    }

    // Shared volume and node assignment, common to all build pods
    fn configure(&self, pod: &mut Pod) {
        let driver_spec = self.driver.spec.as_ref();
        let Some(spec) = pod.spec.as_mut() else {
            return;
        };

        spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: CODE_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: self.volume_claim_name(),
                ..Default::default()
            }),
            ..Default::default()
        });

        spec.node_selector = driver_spec.and_then(|s| s.node_selector.clone());
        spec.tolerations = driver_spec.and_then(|s| s.tolerations.clone());

        // ReadWriteOnce volume: stay on the driver's node
        spec.affinity = Some(Affinity {
            pod_affinity: Some(PodAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_labels: self.driver.metadata.labels.clone(),
                        ..Default::default()
                    }),
                    topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
}

fn zero_requests() -> ResourceRequirements {
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity("0".to_string()));
    requests.insert("memory".to_string(), Quantity("0".to_string()));
    ResourceRequirements {
        requests: Some(requests),
        ..Default::default()
    }
}
