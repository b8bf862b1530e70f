//! Inbound scan request and size measurement types

use serde::{Deserialize, Serialize};

/// A queued scan as published on the request feed.
///
/// The status row keyed by `id` already exists in `Queued` state when this arrives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    /// Primary key of the status row to update once scheduled
    pub id: i64,
    /// Repository owner (user or organization)
    pub namespace: String,
    /// Repository name, as spelled on the source-control host
    pub repo_name: String,
    /// Clone URL handed to the scanner
    pub url: String,
    /// Access token, encrypted upstream; passed through untouched
    #[serde(default)]
    pub encrypted_token: String,
    /// Whether the repository is private
    #[serde(default)]
    pub is_private: bool,
}

impl ScanRequest {
    /// `owner/name` form used in logs and errors
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.repo_name)
    }
}

/// Repository size in kilobytes as reported by the source-control host.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct SizeMeasurement(f64);

impl SizeMeasurement {
    /// Wrap a raw kilobyte count. Negative and non-finite values clamp to zero.
    pub fn from_kb(kb: f64) -> Self {
        if kb.is_finite() && kb > 0.0 {
            Self(kb)
        } else {
            Self(0.0)
        }
    }

    /// Size in kilobytes, never negative
    pub fn kb(self) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_feed_message() {
        let raw = r#"{
            "id": 42,
            "namespace": "acme",
            "repoName": "Payments_Service",
            "url": "https://github.com/acme/Payments_Service",
            "encryptedToken": "b64blob",
            "isPrivate": true
        }"#;
        let req: ScanRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.id, 42);
        assert_eq!(req.repo_name, "Payments_Service");
        assert!(req.is_private);
        assert_eq!(req.full_name(), "acme/Payments_Service");
    }

    #[test]
    fn token_and_privacy_default_when_absent() {
        let raw = r#"{"id":1,"namespace":"o","repoName":"r","url":"u"}"#;
        let req: ScanRequest = serde_json::from_str(raw).unwrap();
        assert!(!req.is_private);
        assert!(req.encrypted_token.is_empty());
    }

    #[test]
    fn measurement_clamps_bad_input() {
        assert_eq!(SizeMeasurement::from_kb(-5.0).kb(), 0.0);
        assert_eq!(SizeMeasurement::from_kb(f64::NAN).kb(), 0.0);
        assert_eq!(SizeMeasurement::from_kb(f64::INFINITY).kb(), 0.0);
        assert_eq!(SizeMeasurement::from_kb(512.5).kb(), 512.5);
    }
}
