//! End-to-end allocation of one scan request
//!
//! Received → Sized → Identified → VolumeProvisioned → PodProvisioned →
//! ClaimProvisioned → Recorded
//!
//! Any failure aborts the request and is returned to the caller; the status row stays
//! `Queued` unless the final step succeeded. If only the status write fails, the pod and
//! volume are deleted again so no unrecorded scan keeps running.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use scanq_common::retry_with_backoff_if;

use crate::capacity::{classify, CapacityPlan};
use crate::config::AllocatorConfig;
use crate::error::{AllocationError, ProvisioningStage};
use crate::identity::{derive_names, RunIdentity};
use crate::provisioner::{ProvisionedResourceSet, ResourceProvisioner, ScanClusterClient};
use crate::request::ScanRequest;
use crate::sizing::RepoSizeLookup;
use crate::status::{ScheduledRecord, StatusStore};

/// Progress of a single request through allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AllocationStage {
    /// Request accepted
    Received,
    /// Capacity plan computed
    Sized,
    /// Run identity and names derived
    Identified,
    /// Volume created
    VolumeProvisioned,
    /// Pod created
    PodProvisioned,
    /// Claim created
    ClaimProvisioned,
    /// Status row updated
    Recorded,
}

impl AllocationStage {
    /// Last stage completed before `failed` was attempted
    pub fn before(failed: ProvisioningStage) -> Self {
        match failed {
            ProvisioningStage::Volume => AllocationStage::Identified,
            ProvisioningStage::Pod => AllocationStage::VolumeProvisioned,
            ProvisioningStage::Claim => AllocationStage::PodProvisioned,
        }
    }
}

impl fmt::Display for AllocationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of a completed allocation
#[derive(Clone, Debug, PartialEq)]
pub struct Allocation {
    /// Sizing used for the volume and claim
    pub plan: CapacityPlan,
    /// Cluster resources created
    pub resources: ProvisionedResourceSet,
    /// Status transition written
    pub record: ScheduledRecord,
    /// Always [`AllocationStage::Recorded`]
    pub stage: AllocationStage,
}

/// Runs the allocation workflow against injected collaborators
pub struct AllocationOrchestrator {
    sizes: Arc<dyn RepoSizeLookup>,
    provisioner: ResourceProvisioner,
    status: Arc<dyn StatusStore>,
    config: AllocatorConfig,
}

impl AllocationOrchestrator {
    /// Orchestrator over the given size source, cluster and status store
    pub fn new(
        sizes: Arc<dyn RepoSizeLookup>,
        cluster: Arc<dyn ScanClusterClient>,
        status: Arc<dyn StatusStore>,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            sizes,
            provisioner: ResourceProvisioner::new(cluster, config.clone()),
            status,
            config,
        }
    }

    /// Allocate resources for `request` and mark it `Scheduled`.
    #[instrument(skip_all, fields(request_id = request.id, repo = %request.full_name()))]
    pub async fn process(&self, request: &ScanRequest) -> Result<Allocation, AllocationError> {
        let mut stage = AllocationStage::Received;
        debug!(%stage, "Allocation started");

        let sizes = self.sizes.as_ref();
        let size = retry_with_backoff_if(
            &self.config.retry,
            "repo_size",
            move || sizes.repo_size(request),
            AllocationError::is_retryable,
        )
        .await
        .inspect_err(|e| warn!(%stage, error = %e, "Size lookup failed"))?;

        let plan = classify(size);
        stage = AllocationStage::Sized;
        debug!(%stage, size_kb = size.kb(), requested = %plan.requested, actual = %plan.actual, "Classified");

        let identity = RunIdentity::generate();
        let names = derive_names(&identity, &request.repo_name);
        stage = AllocationStage::Identified;
        debug!(%stage, scan_id = %identity, pod = %names.pod, "Derived resource names");

        let resources = self
            .provisioner
            .provision(&plan, &names, &identity, request)
            .await
            .inspect_err(|e| {
                let reached = e.stage().map(AllocationStage::before).unwrap_or(stage);
                warn!(stage = %reached, scan_id = %identity, error = %e, "Provisioning failed");
            })?;
        stage = AllocationStage::ClaimProvisioned;

        let status = self.status.as_ref();
        let request_id = request.id;
        let record = match retry_with_backoff_if(
            &self.config.retry,
            "mark_scheduled",
            move || status.mark_scheduled(request_id, identity),
            AllocationError::is_retryable,
        )
        .await
        {
            Ok(record) => record,
            Err(e) => {
                // An unrecorded scan must not keep running
                warn!(%stage, scan_id = %identity, error = %e, "Status update failed");
                let stranded = self.provisioner.release(&resources).await;
                return Err(e.with_stranded(stranded));
            }
        };
        stage = AllocationStage::Recorded;

        info!(
            %stage,
            scan_id = %identity,
            pod = %resources.names.pod,
            capacity = %plan.actual,
            "Scan scheduled"
        );

        Ok(Allocation {
            plan,
            resources,
            record,
            stage,
        })
    }
}
