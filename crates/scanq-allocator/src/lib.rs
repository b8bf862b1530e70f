//! Dynamic per-scan resource provisioning
//!
//! Turns one queued scan request into an isolated environment on the cluster:
//! - sizes a volume from the repository size (`capacity`)
//! - mints a run identity and derives child resource names (`identity`)
//! - creates volume → pod → claim, the claim owned by the pod (`provisioner`)
//! - marks the request `Scheduled` in the status store (`status`)
//!
//! `orchestrator` sequences the steps; `reaper` sweeps leftovers.

#![deny(missing_docs)]

pub mod capacity;
pub mod config;
pub mod error;
pub mod identity;
pub mod manifests;
pub mod orchestrator;
pub mod provisioner;
pub mod reaper;
pub mod request;
pub mod sizing;
pub mod status;

pub use capacity::{classify, Capacity, CapacityPlan, CapacityUnit};
pub use config::{AllocatorConfig, ResourceBaseline};
pub use error::{AllocationError, ProvisioningStage};
pub use identity::{derive_names, ResourceNames, RunIdentity};
pub use orchestrator::{Allocation, AllocationOrchestrator, AllocationStage};
pub use provisioner::{KubeScanClient, ProvisionedResourceSet, ResourceProvisioner, ScanClusterClient};
pub use reaper::{OrphanReaper, SweepReport};
pub use request::{ScanRequest, SizeMeasurement};
pub use sizing::{GithubSizeLookup, RepoSizeLookup, TokenDecryptor};
pub use status::{PgStatusStore, QueueStatus, ScheduledRecord, StatusStore};

/// Result type alias for allocation operations
pub type Result<T> = std::result::Result<T, AllocationError>;
