//! Typed builders for the volume, pod and claim of one scan
//!
//! Builders are pure; `provisioner` sends them to the cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, HostPathVolumeSource, LocalObjectReference,
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, Pod, PodSpec, ResourceRequirements,
    SecretKeySelector, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::capacity::CapacityPlan;
use crate::config::{AllocatorConfig, SECRET_ENV_KEYS};
use crate::identity::{ResourceNames, RunIdentity};
use crate::request::ScanRequest;

/// Label carrying the run identity on every child resource
pub const SCAN_ID_LABEL: &str = "scanq.io/scan-id";
/// Standard managed-by label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Label selector matching everything scanq creates
pub const MANAGED_SELECTOR: &str = "app.kubernetes.io/managed-by=scanq";

const SCAN_VOLUME_NAME: &str = "scan-volume";
const ACCESS_MODE: &str = "ReadWriteMany";
const VOLUME_MODE: &str = "Filesystem";

fn labels(identity: &RunIdentity) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), scanq_common::MANAGED_BY.to_string()),
        (SCAN_ID_LABEL.to_string(), identity.to_string()),
    ])
}

fn storage(quantity: String) -> BTreeMap<String, Quantity> {
    BTreeMap::from([("storage".to_string(), Quantity(quantity))])
}

/// Cluster-scoped volume sized to the plan's actual capacity.
///
/// Reclaim policy `Delete`: once the claim goes away the volume is removed with it.
pub fn build_volume(
    config: &AllocatorConfig,
    names: &ResourceNames,
    identity: &RunIdentity,
    plan: &CapacityPlan,
    request: &ScanRequest,
) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(names.volume.clone()),
            labels: Some(labels(identity)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(storage(plan.actual.to_quantity())),
            access_modes: Some(vec![ACCESS_MODE.to_string()]),
            volume_mode: Some(VOLUME_MODE.to_string()),
            storage_class_name: Some(config.storage_class.clone()),
            persistent_volume_reclaim_policy: Some("Delete".to_string()),
            host_path: Some(HostPathVolumeSource {
                path: config.host_path_for(&request.repo_name),
                type_: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Scanner pod mounting the claim by name. The claim does not exist yet.
pub fn build_pod(
    config: &AllocatorConfig,
    names: &ResourceNames,
    identity: &RunIdentity,
    request: &ScanRequest,
) -> Pod {
    let mut env = vec![
        plain_env("URL", &request.url),
        plain_env("ENCRYPTED_TOKEN", &request.encrypted_token),
        plain_env("IS_PRIVATE", &request.is_private.to_string()),
        plain_env("SCAN_ID", &identity.to_string()),
    ];
    env.extend(
        SECRET_ENV_KEYS
            .iter()
            .map(|key| secret_env(key, &config.env_secret)),
    );

    let resources = &config.resources;
    let container = Container {
        name: names.pod.clone(),
        image: Some(config.image.clone()),
        image_pull_policy: Some("Always".to_string()),
        env: Some(env),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(resources.cpu_request.clone())),
                ("memory".to_string(), Quantity(resources.memory_request.clone())),
            ])),
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(resources.cpu_limit.clone())),
                ("memory".to_string(), Quantity(resources.memory_limit.clone())),
            ])),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: SCAN_VOLUME_NAME.to_string(),
            mount_path: config.mount_path.clone(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(names.pod.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels(identity)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            image_pull_secrets: Some(vec![LocalObjectReference {
                name: config.image_pull_secret.clone(),
            }]),
            restart_policy: Some("Never".to_string()),
            volumes: Some(vec![Volume {
                name: SCAN_VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: names.claim.clone(),
                    read_only: Some(false),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Claim for the requested capacity, bound to our volume and owned by the pod.
///
/// Deleting the pod garbage-collects the claim; the volume follows via its reclaim policy.
pub fn build_claim(
    config: &AllocatorConfig,
    names: &ResourceNames,
    identity: &RunIdentity,
    plan: &CapacityPlan,
    pod_uid: &str,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(names.claim.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels(identity)),
            owner_references: Some(vec![OwnerReference {
                api_version: "v1".to_string(),
                kind: "Pod".to_string(),
                name: names.pod.clone(),
                uid: pod_uid.to_string(),
                controller: None,
                block_owner_deletion: None,
            }]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![ACCESS_MODE.to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(storage(plan.requested.to_quantity())),
                ..Default::default()
            }),
            storage_class_name: Some(config.storage_class.clone()),
            volume_mode: Some(VOLUME_MODE.to_string()),
            volume_name: Some(names.volume.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn secret_env(key: &str, secret: &str) -> EnvVar {
    EnvVar {
        name: key.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}
