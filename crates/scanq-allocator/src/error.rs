//! Allocation error types
//!
//! Every variant aborts the request it belongs to. None of them terminate the process.

use std::fmt;

use thiserror::Error;

/// Which cluster create call failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisioningStage {
    /// PersistentVolume
    Volume,
    /// Worker pod
    Pod,
    /// PersistentVolumeClaim
    Claim,
}

impl fmt::Display for ProvisioningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProvisioningStage::Volume => "volume",
            ProvisioningStage::Pod => "pod",
            ProvisioningStage::Claim => "claim",
        })
    }
}

/// Failure of one scan allocation
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Repository size could not be obtained
    #[error("size lookup failed for {repo}: {message}")]
    SizeLookup {
        /// `owner/name` of the repository
        repo: String,
        /// What went wrong
        message: String,
        /// Whether a later attempt may succeed
        retryable: bool,
    },

    /// The cluster rejected or failed a create call
    #[error("provisioning failed at {stage} stage: {source}")]
    Provisioning {
        /// Step that failed
        stage: ProvisioningStage,
        /// Underlying API error
        source: kube::Error,
        /// Resources created earlier whose rollback also failed
        stranded: Vec<String>,
    },

    /// The status write failed
    #[error("status update failed for request {request_id}: {source}")]
    Persistence {
        /// Request whose row was being updated
        request_id: i64,
        /// Underlying database error
        source: sqlx::Error,
        /// Cluster resources left behind when releasing them also failed
        stranded: Vec<String>,
    },

    /// The status update matched no row
    #[error("no scan request with id {request_id}")]
    NoSuchRequest {
        /// Request id that matched nothing
        request_id: i64,
        /// Cluster resources left behind when releasing them also failed
        stranded: Vec<String>,
    },
}

impl AllocationError {
    /// Transient size lookup failure (network, 5xx, rate limiting)
    pub fn size_lookup(repo: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SizeLookup {
            repo: repo.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Size lookup failure a retry cannot fix (404, unparseable body)
    pub fn size_lookup_permanent(repo: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SizeLookup {
            repo: repo.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Cluster failure at `stage` with nothing stranded
    pub fn provisioning(stage: ProvisioningStage, source: kube::Error) -> Self {
        Self::Provisioning {
            stage,
            source,
            stranded: Vec::new(),
        }
    }

    /// Status write failure
    pub fn persistence(request_id: i64, source: sqlx::Error) -> Self {
        Self::Persistence {
            request_id,
            source,
            stranded: Vec::new(),
        }
    }

    /// Status update that matched no row
    pub fn no_such_request(request_id: i64) -> Self {
        Self::NoSuchRequest {
            request_id,
            stranded: Vec::new(),
        }
    }

    /// Record resources whose cleanup failed after this error. Size lookup errors
    /// happen before anything exists and are returned unchanged.
    pub fn with_stranded(mut self, names: Vec<String>) -> Self {
        match &mut self {
            AllocationError::Provisioning { stranded, .. }
            | AllocationError::Persistence { stranded, .. }
            | AllocationError::NoSuchRequest { stranded, .. } => stranded.extend(names),
            AllocationError::SizeLookup { .. } => {}
        }
        self
    }

    /// Resources known to be left on the cluster, as `kind/name`
    pub fn stranded(&self) -> &[String] {
        match self {
            AllocationError::Provisioning { stranded, .. }
            | AllocationError::Persistence { stranded, .. }
            | AllocationError::NoSuchRequest { stranded, .. } => stranded.as_slice(),
            AllocationError::SizeLookup { .. } => &[],
        }
    }

    /// Stage that failed, if this is a provisioning error
    pub fn stage(&self) -> Option<ProvisioningStage> {
        match self {
            AllocationError::Provisioning { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Whether retrying the failed step may succeed.
    ///
    /// Kubernetes 4xx rejections are permanent except 429. Missing status rows are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            AllocationError::SizeLookup { retryable, .. } => *retryable,
            AllocationError::Provisioning { source, .. } => is_transient_kube_error(source),
            AllocationError::Persistence { source, .. } => !matches!(
                source,
                sqlx::Error::RowNotFound | sqlx::Error::ColumnNotFound(_) | sqlx::Error::TypeNotFound { .. }
            ),
            AllocationError::NoSuchRequest { .. } => false,
        }
    }
}

/// Transport failures and 5xx/429 responses are worth another attempt
pub fn is_transient_kube_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => ae.code == 429 || !(400..500).contains(&ae.code),
        _ => true,
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} (test)"),
        reason: reason.to_string(),
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_error_names_stage() {
        let err = AllocationError::provisioning(ProvisioningStage::Pod, api_error(403, "Forbidden"));
        assert!(err.to_string().contains("pod stage"));
        assert_eq!(err.stage(), Some(ProvisioningStage::Pod));
    }

    #[test]
    fn client_errors_are_permanent_except_throttling() {
        let rejected = AllocationError::provisioning(ProvisioningStage::Volume, api_error(422, "Invalid"));
        assert!(!rejected.is_retryable());

        let conflict = AllocationError::provisioning(ProvisioningStage::Claim, api_error(409, "AlreadyExists"));
        assert!(!conflict.is_retryable());

        let throttled = AllocationError::provisioning(ProvisioningStage::Pod, api_error(429, "TooManyRequests"));
        assert!(throttled.is_retryable());

        let unavailable = AllocationError::provisioning(ProvisioningStage::Pod, api_error(503, "ServiceUnavailable"));
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn missing_row_is_permanent() {
        let err = AllocationError::no_such_request(9);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("9"));
    }

    #[test]
    fn size_lookup_retryability_follows_constructor() {
        assert!(AllocationError::size_lookup("o/r", "timeout").is_retryable());
        assert!(!AllocationError::size_lookup_permanent("o/r", "404").is_retryable());
        assert_eq!(AllocationError::size_lookup("o/r", "x").stage(), None);
    }

    #[test]
    fn pool_timeouts_are_transient() {
        let err = AllocationError::persistence(1, sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
    }

    #[test]
    fn stranded_resources_attach_to_cluster_and_status_errors() {
        let err = AllocationError::no_such_request(4).with_stranded(vec!["pod/web-x".to_string()]);
        assert_eq!(err.stranded(), ["pod/web-x".to_string()]);

        let err = AllocationError::size_lookup("o/r", "timeout").with_stranded(vec!["x".to_string()]);
        assert!(err.stranded().is_empty());
    }
}
