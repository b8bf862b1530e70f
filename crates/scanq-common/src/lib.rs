//! Common plumbing for scanq: retry with backoff and telemetry setup

#![deny(missing_docs)]

pub mod retry;
pub mod telemetry;

pub use retry::{retry_with_backoff_if, RetryConfig};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryError, TelemetryGuard};

/// Value of the `app.kubernetes.io/managed-by` label on every object scanq creates
pub const MANAGED_BY: &str = "scanq";
