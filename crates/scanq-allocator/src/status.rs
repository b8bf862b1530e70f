//! Scan request status persistence

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::AllocationError;
use crate::identity::RunIdentity;

/// Lifecycle states of a scan request row that this crate reads or writes.
///
/// Terminal states are set by the watcher that follows the scan pod, not here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    /// Waiting for resources
    Queued,
    /// Volume, pod and claim exist
    Scheduled,
}

impl QueueStatus {
    /// Value stored in `scan_requests.queue_status`
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "Queued",
            QueueStatus::Scheduled => "Scheduled",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful status transition wrote
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledRecord {
    /// Request row that was updated
    pub request_id: i64,
    /// Identity stored for downstream correlation
    pub run_identity: RunIdentity,
    /// New state
    pub status: QueueStatus,
    /// Modification timestamp written
    pub modified_at: DateTime<Utc>,
}

/// Status record store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Move the row for `request_id` to `Scheduled` and store `run_identity`.
    ///
    /// Fails with [`AllocationError::NoSuchRequest`] when no row matches.
    async fn mark_scheduled(
        &self,
        request_id: i64,
        run_identity: RunIdentity,
    ) -> Result<ScheduledRecord, AllocationError>;
}

/// Postgres-backed [`StatusStore`] on the `scan_requests` table
#[derive(Clone, Debug)]
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    /// Store using `pool`
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const MARK_SCHEDULED_SQL: &str = r#"
    UPDATE scan_requests
    SET queue_status = $1, modified_at = $2, scan_id = $3
    WHERE id = $4
"#;

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn mark_scheduled(
        &self,
        request_id: i64,
        run_identity: RunIdentity,
    ) -> Result<ScheduledRecord, AllocationError> {
        let modified_at = Utc::now();
        let result = sqlx::query(MARK_SCHEDULED_SQL)
            .bind(QueueStatus::Scheduled.as_str())
            .bind(modified_at)
            .bind(run_identity.to_string())
            .bind(request_id)
            .execute(&self.pool)
            .await
            .map_err(|source| AllocationError::persistence(request_id, source))?;

        check_affected(request_id, result.rows_affected())?;
        debug!(request_id, scan_id = %run_identity, "Marked scan request Scheduled");

        Ok(ScheduledRecord {
            request_id,
            run_identity,
            status: QueueStatus::Scheduled,
            modified_at,
        })
    }
}

fn check_affected(request_id: i64, rows: u64) -> Result<(), AllocationError> {
    if rows == 0 {
        return Err(AllocationError::no_such_request(request_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_column_values() {
        assert_eq!(QueueStatus::Queued.as_str(), "Queued");
        assert_eq!(QueueStatus::Scheduled.to_string(), "Scheduled");
    }

    #[test]
    fn zero_rows_is_no_such_request() {
        assert!(matches!(
            check_affected(12, 0),
            Err(AllocationError::NoSuchRequest { request_id: 12, .. })
        ));
        assert!(check_affected(12, 1).is_ok());
    }

    #[test]
    fn update_targets_single_row_by_id() {
        let sql = MARK_SCHEDULED_SQL.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(
            sql,
            "UPDATE scan_requests SET queue_status = $1, modified_at = $2, scan_id = $3 WHERE id = $4"
        );
    }
}
