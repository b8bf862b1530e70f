//! Sweep of scan storage left behind by failed rollbacks or finished runs
//!
//! Claims are normally removed with their owning pod. Volumes use the `Delete`
//! reclaim policy, but hostPath volumes on a static storage class stay `Released`
//! until someone removes them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::{PersistentVolume, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, instrument, warn};

use crate::manifests::MANAGED_SELECTOR;
use crate::provisioner::ScanClusterClient;

/// Outcome of one sweep
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Claims deleted because no pod mounted them
    pub claims_deleted: usize,
    /// Unbound volumes deleted after the grace period
    pub volumes_deleted: usize,
    /// Deletes that failed and were skipped
    pub failures: usize,
}

/// Deletes scanq-managed claims and volumes nothing uses any more
pub struct OrphanReaper {
    cluster: Arc<dyn ScanClusterClient>,
    namespace: String,
}

impl OrphanReaper {
    /// Reaper for claims in `namespace` and all scanq volumes
    pub fn new(cluster: Arc<dyn ScanClusterClient>, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
        }
    }

    /// Run one sweep.
    ///
    /// List failures abort the sweep. Individual delete failures are counted in
    /// [`SweepReport::failures`] and the sweep moves on.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn sweep(&self, grace: Duration) -> Result<SweepReport, kube::Error> {
        let mut report = SweepReport::default();

        // Claims first: a pod always exists before its claim, so every claim listed
        // here that is still in use has its pod in the later listing.
        let claims = self
            .cluster
            .list_claims(&self.namespace, MANAGED_SELECTOR)
            .await?;
        let pods = self.cluster.list_pods(&self.namespace).await?;
        let mounted = mounted_claims(&pods);

        for claim in claims {
            if !older_than(&claim.metadata, grace) {
                continue;
            }
            let Some(name) = claim.metadata.name else {
                continue;
            };
            if mounted.contains(name.as_str()) {
                continue;
            }
            match self.cluster.delete_claim(&self.namespace, &name).await {
                Ok(()) => {
                    debug!(claim = %name, "Deleted unmounted claim");
                    report.claims_deleted += 1;
                }
                Err(e) => {
                    warn!(claim = %name, error = %e, "Failed to delete unmounted claim");
                    report.failures += 1;
                }
            }
        }

        let volumes = self.cluster.list_volumes(MANAGED_SELECTOR).await?;
        for volume in volumes.iter().filter(|pv| is_reclaimable(pv, grace)) {
            let Some(name) = volume.metadata.name.as_deref() else {
                continue;
            };
            match self.cluster.delete_volume(name).await {
                Ok(()) => {
                    debug!(volume = %name, "Deleted unbound volume");
                    report.volumes_deleted += 1;
                }
                Err(e) => {
                    warn!(volume = %name, error = %e, "Failed to delete unbound volume");
                    report.failures += 1;
                }
            }
        }

        info!(
            claims_deleted = report.claims_deleted,
            volumes_deleted = report.volumes_deleted,
            failures = report.failures,
            "Sweep complete"
        );
        Ok(report)
    }
}

fn mounted_claims(pods: &[Pod]) -> HashSet<&str> {
    pods.iter()
        .filter_map(|pod| pod.spec.as_ref()?.volumes.as_ref())
        .flatten()
        .filter_map(|v| v.persistent_volume_claim.as_ref())
        .map(|source| source.claim_name.as_str())
        .collect()
}

/// Unbound (`Available` or `Released`) and older than `grace`
fn is_reclaimable(pv: &PersistentVolume, grace: Duration) -> bool {
    let phase = pv.status.as_ref().and_then(|s| s.phase.as_deref());
    if !matches!(phase, Some("Available" | "Released")) {
        return false;
    }
    older_than(&pv.metadata, grace)
}

/// Created at least `grace` ago. Objects without a timestamp are never old enough.
fn older_than(meta: &ObjectMeta, grace: Duration) -> bool {
    let Some(created) = meta.creation_timestamp.as_ref() else {
        return false;
    };
    let age = Utc::now().signed_duration_since(created.0);
    age.to_std().map(|age| age >= grace).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::api_error;
    use crate::provisioner::MockScanClusterClient;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, PersistentVolumeStatus, PodSpec,
        Volume,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    const GRACE: Duration = Duration::from_secs(600);

    fn pod_mounting(claim: &str) -> Pod {
        Pod {
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "scan-volume".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn created_ago(age: Duration) -> Option<Time> {
        Some(Time(Utc::now() - chrono::Duration::from_std(age).unwrap()))
    }

    fn claim_aged(name: &str, age: Duration) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                creation_timestamp: created_ago(age),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn claim(name: &str) -> PersistentVolumeClaim {
        claim_aged(name, Duration::from_secs(3600))
    }

    fn volume(name: &str, phase: &str, age: Duration) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                creation_timestamp: created_ago(age),
                ..Default::default()
            },
            status: Some(PersistentVolumeStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn only_old_unbound_volumes_are_reclaimable() {
        let old = Duration::from_secs(3600);
        let fresh = Duration::from_secs(10);
        assert!(is_reclaimable(&volume("a", "Released", old), GRACE));
        assert!(is_reclaimable(&volume("b", "Available", old), GRACE));
        assert!(!is_reclaimable(&volume("c", "Bound", old), GRACE));
        assert!(!is_reclaimable(&volume("d", "Released", fresh), GRACE));
        assert!(!is_reclaimable(&PersistentVolume::default(), GRACE));
    }

    #[test]
    fn collects_claims_from_pod_volumes() {
        let pods = vec![pod_mounting("scan-pvc-1"), Pod::default(), pod_mounting("scan-pvc-2")];
        let mounted = mounted_claims(&pods);
        assert_eq!(mounted, HashSet::from(["scan-pvc-1", "scan-pvc-2"]));
    }

    #[tokio::test]
    async fn deletes_unmounted_claims_and_stale_volumes() {
        let mut cluster = MockScanClusterClient::new();
        cluster
            .expect_list_pods()
            .withf(|ns| ns == "scans")
            .returning(|_| Ok(vec![pod_mounting("scan-pvc-live")]));
        cluster
            .expect_list_claims()
            .withf(|ns, sel| ns == "scans" && sel == MANAGED_SELECTOR)
            .returning(|_, _| Ok(vec![claim("scan-pvc-live"), claim("scan-pvc-orphan")]));
        cluster
            .expect_delete_claim()
            .withf(|_, name| name == "scan-pvc-orphan")
            .times(1)
            .returning(|_, _| Ok(()));
        cluster.expect_list_volumes().returning(|_| {
            Ok(vec![
                volume("scan-pv-bound", "Bound", Duration::from_secs(7200)),
                volume("scan-pv-stale", "Released", Duration::from_secs(7200)),
                volume("scan-pv-new", "Available", Duration::from_secs(5)),
            ])
        });
        cluster
            .expect_delete_volume()
            .withf(|name| name == "scan-pv-stale")
            .times(1)
            .returning(|_| Ok(()));

        let reaper = OrphanReaper::new(Arc::new(cluster), "scans");
        let report = reaper.sweep(GRACE).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                claims_deleted: 1,
                volumes_deleted: 1,
                failures: 0
            }
        );
    }

    #[tokio::test]
    async fn delete_failures_are_counted_not_fatal() {
        let mut cluster = MockScanClusterClient::new();
        cluster.expect_list_pods().returning(|_| Ok(vec![]));
        cluster
            .expect_list_claims()
            .returning(|_, _| Ok(vec![claim("scan-pvc-a"), claim("scan-pvc-b")]));
        cluster.expect_delete_claim().returning(|_, name| {
            if name == "scan-pvc-a" {
                Err(api_error(500, "InternalError"))
            } else {
                Ok(())
            }
        });
        cluster.expect_list_volumes().returning(|_| {
            Ok(vec![volume("scan-pv-a", "Released", Duration::from_secs(7200))])
        });
        cluster
            .expect_delete_volume()
            .returning(|_| Err(api_error(403, "Forbidden")));

        let reaper = OrphanReaper::new(Arc::new(cluster), "scans");
        let report = reaper.sweep(GRACE).await.unwrap();
        assert_eq!(report.claims_deleted, 1);
        assert_eq!(report.volumes_deleted, 0);
        assert_eq!(report.failures, 2);
    }

    #[tokio::test]
    async fn fresh_unmounted_claim_is_left_alone() {
        let mut cluster = MockScanClusterClient::new();
        cluster
            .expect_list_claims()
            .returning(|_, _| Ok(vec![claim_aged("scan-pvc-new", Duration::ZERO)]));
        cluster.expect_list_pods().returning(|_| Ok(vec![]));
        cluster.expect_delete_claim().never();
        cluster.expect_list_volumes().returning(|_| Ok(vec![]));

        let reaper = OrphanReaper::new(Arc::new(cluster), "scans");
        assert_eq!(reaper.sweep(GRACE).await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn claims_are_listed_before_pods() {
        let mut cluster = MockScanClusterClient::new();
        let mut seq = mockall::Sequence::new();
        cluster
            .expect_list_claims()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(vec![]));
        cluster
            .expect_list_pods()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![]));
        cluster
            .expect_list_volumes()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![]));

        let reaper = OrphanReaper::new(Arc::new(cluster), "scans");
        assert!(reaper.sweep(GRACE).await.is_ok());
    }

    #[tokio::test]
    async fn list_failure_aborts_sweep() {
        let mut cluster = MockScanClusterClient::new();
        cluster.expect_list_claims().returning(|_, _| Ok(vec![claim("scan-pvc-a")]));
        cluster
            .expect_list_pods()
            .returning(|_| Err(api_error(503, "ServiceUnavailable")));
        cluster.expect_delete_claim().never();
        cluster.expect_delete_volume().never();

        let reaper = OrphanReaper::new(Arc::new(cluster), "scans");
        assert!(reaper.sweep(GRACE).await.is_err());
    }
}
