//! Repository size lookup against the source-control host

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::AllocationError;
use crate::request::{ScanRequest, SizeMeasurement};

/// Default REST API base of the source-control host
pub const DEFAULT_SCM_API_URL: &str = "https://api.github.com";

/// Source of repository sizes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RepoSizeLookup: Send + Sync {
    /// Size of the repository named by `request`, in kilobytes
    async fn repo_size(&self, request: &ScanRequest) -> Result<SizeMeasurement, AllocationError>;
}

/// Turns a request's `encrypted_token` into a usable access token
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenDecryptor: Send + Sync {
    /// Plaintext token for `encrypted`
    async fn decrypt(&self, encrypted: &str) -> Result<String, AllocationError>;
}

/// GitHub REST `GET /repos/{owner}/{repo}` lookup.
///
/// Authenticates with the service's API token, or for private repositories with the
/// request's own token when a [`TokenDecryptor`] is configured. The `size` field is in
/// kilobytes.
pub struct GithubSizeLookup {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
    decryptor: Option<Arc<dyn TokenDecryptor>>,
}

#[derive(Deserialize)]
struct RepoDetails {
    size: f64,
}

impl GithubSizeLookup {
    /// Lookup against `api_url` with an optional bearer token
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("scanq/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
            decryptor: None,
        })
    }

    /// Authenticate private repository lookups with the request's decrypted token
    pub fn with_decryptor(mut self, decryptor: Arc<dyn TokenDecryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// Bearer token for `request`
    async fn credential(&self, request: &ScanRequest) -> Result<Option<String>, AllocationError> {
        match &self.decryptor {
            Some(decryptor) if request.is_private && !request.encrypted_token.is_empty() => {
                decryptor.decrypt(&request.encrypted_token).await.map(Some)
            }
            _ => Ok(self.token.clone()),
        }
    }

    fn repo_url(&self, request: &ScanRequest) -> String {
        format!(
            "{}/repos/{}/{}",
            self.api_url, request.namespace, request.repo_name
        )
    }
}

#[async_trait]
impl RepoSizeLookup for GithubSizeLookup {
    async fn repo_size(&self, request: &ScanRequest) -> Result<SizeMeasurement, AllocationError> {
        let repo = request.full_name();
        let mut req = self
            .http
            .get(self.repo_url(request))
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = self.credential(request).await? {
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| AllocationError::size_lookup(&repo, e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AllocationError::size_lookup(&repo, e.to_string()))?;

        let size = parse_repo_size(&repo, status, &body)?;
        debug!(repo = %repo, size_kb = size.kb(), "Fetched repository size");
        Ok(size)
    }
}

/// Interpret a repository details response
fn parse_repo_size(
    repo: &str,
    status: StatusCode,
    body: &str,
) -> Result<SizeMeasurement, AllocationError> {
    if !status.is_success() {
        let msg = format!("unable to get repo size ({status}): {body}");
        return Err(
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                AllocationError::size_lookup(repo, msg)
            } else {
                AllocationError::size_lookup_permanent(repo, msg)
            },
        );
    }

    let details: RepoDetails = serde_json::from_str(body).map_err(|e| {
        AllocationError::size_lookup_permanent(repo, format!("malformed repo details: {e}"))
    })?;
    Ok(SizeMeasurement::from_kb(details.size))
}
