//! Cluster-side provisioning of one scan environment
//!
//! Creates, in order:
//! 1. the PersistentVolume (fails fast on storage misconfiguration)
//! 2. the pod, mounting a claim that does not exist yet
//! 3. the claim, owned by the pod so pod deletion cascades to it
//!
//! A failure at step 2 or 3 rolls back what was created before it, best effort.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use scanq_common::retry_with_backoff_if;

use crate::capacity::CapacityPlan;
use crate::config::AllocatorConfig;
use crate::error::{is_transient_kube_error, AllocationError, ProvisioningStage};
use crate::identity::{ResourceNames, RunIdentity};
use crate::manifests;
use crate::request::ScanRequest;

/// Cluster operations scanq needs.
///
/// Lets tests mock the API server; production uses [`KubeScanClient`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScanClusterClient: Send + Sync {
    /// Create a cluster-scoped PersistentVolume
    async fn create_volume(&self, pv: &PersistentVolume) -> Result<PersistentVolume, kube::Error>;

    /// Create a pod, returning the server's copy (with UID)
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, kube::Error>;

    /// Create a PersistentVolumeClaim
    async fn create_claim(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, kube::Error>;

    /// Delete a PersistentVolume. Missing volumes are not an error.
    async fn delete_volume(&self, name: &str) -> Result<(), kube::Error>;

    /// Delete a pod with background propagation. Missing pods are not an error.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Delete a claim. Missing claims are not an error.
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// List PersistentVolumes matching a label selector
    async fn list_volumes(&self, selector: &str) -> Result<Vec<PersistentVolume>, kube::Error>;

    /// List every pod in a namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, kube::Error>;

    /// List claims in a namespace matching a label selector
    async fn list_claims(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, kube::Error>;
}

/// [`ScanClusterClient`] backed by a kube `Client`
pub struct KubeScanClient {
    client: Client,
}

impl KubeScanClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), kube::Error> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl ScanClusterClient for KubeScanClient {
    async fn create_volume(&self, pv: &PersistentVolume) -> Result<PersistentVolume, kube::Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.create(&PostParams::default(), pv).await
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), pod).await
    }

    async fn create_claim(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, kube::Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), pvc).await
    }

    async fn delete_volume(&self, name: &str) -> Result<(), kube::Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::background()).await)
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn list_volumes(&self, selector: &str) -> Result<Vec<PersistentVolume>, kube::Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_claims(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, kube::Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }
}

/// One scan's environment as it exists on the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedResourceSet {
    /// Identity embedded in every name
    pub identity: RunIdentity,
    /// Volume, pod and claim names
    pub names: ResourceNames,
    /// UID the API server assigned to the pod
    pub pod_uid: String,
}

/// Resources created so far, in creation order
#[derive(Debug, Clone, PartialEq)]
enum Created {
    Volume(String),
    Pod(String),
}

/// Creates volume → pod → claim and compensates on partial failure
pub struct ResourceProvisioner {
    client: Arc<dyn ScanClusterClient>,
    config: AllocatorConfig,
}

impl ResourceProvisioner {
    /// Provisioner creating objects through `client` shaped by `config`
    pub fn new(client: Arc<dyn ScanClusterClient>, config: AllocatorConfig) -> Self {
        Self { client, config }
    }

    /// Create the scan environment for `request`.
    ///
    /// Each create is retried on transient errors per `config.retry`. On final failure,
    /// resources created earlier in this call are deleted in reverse order; any that
    /// could not be deleted are listed in the error's `stranded` field.
    pub async fn provision(
        &self,
        plan: &CapacityPlan,
        names: &ResourceNames,
        identity: &RunIdentity,
        request: &ScanRequest,
    ) -> Result<ProvisionedResourceSet, AllocationError> {
        let client = self.client.as_ref();
        let namespace = self.config.namespace.as_str();
        let retry = &self.config.retry;
        let mut created = Vec::new();

        // 1. Volume
        let pv = manifests::build_volume(&self.config, names, identity, plan, request);
        let pv_ref = &pv;
        if let Err(e) = retry_with_backoff_if(
            retry,
            "create_volume",
            move || client.create_volume(pv_ref),
            is_transient_kube_error,
        )
        .await
        {
            return Err(self
                .fail(ProvisioningStage::Volume, e, &names.volume, created)
                .await);
        }
        created.push(Created::Volume(names.volume.clone()));
        info!(volume = %names.volume, capacity = %plan.actual, scan_id = %identity, "Created PersistentVolume");

        // 2. Pod
        let pod = manifests::build_pod(&self.config, names, identity, request);
        let pod_ref = &pod;
        let created_pod = match retry_with_backoff_if(
            retry,
            "create_pod",
            move || client.create_pod(namespace, pod_ref),
            is_transient_kube_error,
        )
        .await
        {
            Ok(p) => p,
            Err(e) => {
                return Err(self.fail(ProvisioningStage::Pod, e, &names.pod, created).await);
            }
        };
        created.push(Created::Pod(names.pod.clone()));

        let pod_uid = match created_pod.metadata.uid {
            Some(uid) => uid,
            None => {
                // Without a UID the owner reference cannot be built
                let e = kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: format!("pod {} returned without a UID", names.pod),
                    reason: "MissingUID".to_string(),
                    code: 500,
                });
                return Err(self.rollback_into(ProvisioningStage::Pod, e, created).await);
            }
        };
        info!(pod = %names.pod, uid = %pod_uid, namespace = %namespace, "Created scan pod");

        // 3. Claim
        let pvc = manifests::build_claim(&self.config, names, identity, plan, &pod_uid);
        let pvc_ref = &pvc;
        if let Err(e) = retry_with_backoff_if(
            retry,
            "create_claim",
            move || client.create_claim(namespace, pvc_ref),
            is_transient_kube_error,
        )
        .await
        {
            return Err(self
                .fail(ProvisioningStage::Claim, e, &names.claim, created)
                .await);
        }
        info!(claim = %names.claim, capacity = %plan.requested, owner = %names.pod, "Created PersistentVolumeClaim");

        Ok(ProvisionedResourceSet {
            identity: *identity,
            names: names.clone(),
            pod_uid,
        })
    }

    /// Delete a fully provisioned set: the pod (its claim cascades), then the volume.
    ///
    /// Returns the `kind/name` of anything that could not be deleted.
    pub async fn release(&self, set: &ProvisionedResourceSet) -> Vec<String> {
        warn!(scan_id = %set.identity, pod = %set.names.pod, "Releasing scan resources");
        self.rollback(vec![
            Created::Volume(set.names.volume.clone()),
            Created::Pod(set.names.pod.clone()),
        ])
        .await
    }

    /// Roll back after `stage` failed creating `name`.
    ///
    /// Names are unique per run, so a 409 means an earlier attempt of this very call
    /// created the object before its response was lost; it is rolled back too.
    async fn fail(
        &self,
        stage: ProvisioningStage,
        source: kube::Error,
        name: &str,
        mut created: Vec<Created>,
    ) -> AllocationError {
        if matches!(&source, kube::Error::Api(ae) if ae.code == 409) {
            match stage {
                ProvisioningStage::Volume => created.push(Created::Volume(name.to_string())),
                ProvisioningStage::Pod => created.push(Created::Pod(name.to_string())),
                // owned by the pod, cascades with it
                ProvisioningStage::Claim => {}
            }
        }
        self.rollback_into(stage, source, created).await
    }

    async fn rollback_into(
        &self,
        stage: ProvisioningStage,
        source: kube::Error,
        created: Vec<Created>,
    ) -> AllocationError {
        error!(stage = %stage, error = %source, "Provisioning failed, rolling back");
        let stranded = self.rollback(created).await;
        AllocationError::Provisioning {
            stage,
            source,
            stranded,
        }
    }

    /// Delete `created` in reverse order, returning what could not be deleted
    async fn rollback(&self, created: Vec<Created>) -> Vec<String> {
        let mut stranded = Vec::new();
        for resource in created.into_iter().rev() {
            let (kind, name, result) = match &resource {
                Created::Pod(name) => (
                    "pod",
                    name,
                    self.client.delete_pod(&self.config.namespace, name).await,
                ),
                Created::Volume(name) => ("volume", name, self.client.delete_volume(name).await),
            };
            match result {
                Ok(()) => debug!(kind, name = %name, "Rolled back"),
                Err(e) => {
                    warn!(kind, name = %name, error = %e, "Rollback failed, resource stranded");
                    stranded.push(format!("{kind}/{name}"));
                }
            }
        }
        stranded
    }
}
