//! Fixed shape of every provisioned scan environment

use scanq_common::RetryConfig;

/// Default namespace for scan pods and claims
pub const DEFAULT_NAMESPACE: &str = "trufflehog-scanner";
/// Default storage class on volumes and claims
pub const DEFAULT_STORAGE_CLASS: &str = "manual";
/// Default scanner image
pub const DEFAULT_IMAGE: &str = "sudhagarkv/truffle-scanner:latest";
/// Default image pull secret
pub const DEFAULT_IMAGE_PULL_SECRET: &str = "artifactory-registry";
/// Default secret holding DB and vault coordinates for the scanner
pub const DEFAULT_ENV_SECRET: &str = "global-secret";
/// Default root directory of host-path volumes
pub const DEFAULT_HOST_PATH_ROOT: &str = "/tmp/trufflehog";
/// Default mount path of the scan volume inside the container
pub const DEFAULT_MOUNT_PATH: &str = "/home/scanner/";

/// Keys copied from the env secret into the scanner container.
pub const SECRET_ENV_KEYS: [&str; 8] = [
    "DB_HOST",
    "DB_PORT",
    "DB_NAME",
    "DB_USER",
    "AZURE_CLIENT_ID",
    "AZURE_TENANT_ID",
    "AZURE_CLIENT_SECRET",
    "KEY_VAULT_URL",
];

/// CPU and memory requests/limits of the scanner container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceBaseline {
    /// CPU request
    pub cpu_request: String,
    /// Memory request
    pub memory_request: String,
    /// CPU limit
    pub cpu_limit: String,
    /// Memory limit
    pub memory_limit: String,
}

impl Default for ResourceBaseline {
    fn default() -> Self {
        Self {
            cpu_request: "0.5".to_string(),
            memory_request: "256Mi".to_string(),
            cpu_limit: "3".to_string(),
            memory_limit: "1Gi".to_string(),
        }
    }
}

/// Everything about a scan environment that does not depend on the request
#[derive(Clone, Debug, PartialEq)]
pub struct AllocatorConfig {
    /// Namespace for pods and claims
    pub namespace: String,
    /// Storage class name on both volume and claim
    pub storage_class: String,
    /// Scanner image reference
    pub image: String,
    /// Image pull secret name
    pub image_pull_secret: String,
    /// Secret the `SECRET_ENV_KEYS` are read from
    pub env_secret: String,
    /// Host directory under which each repository gets its volume path
    pub host_path_root: String,
    /// Mount point of the scan volume in the container
    pub mount_path: String,
    /// Container resources
    pub resources: ResourceBaseline,
    /// Backoff for transient cluster, database and size lookup failures
    pub retry: RetryConfig,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            image_pull_secret: DEFAULT_IMAGE_PULL_SECRET.to_string(),
            env_secret: DEFAULT_ENV_SECRET.to_string(),
            host_path_root: DEFAULT_HOST_PATH_ROOT.to_string(),
            mount_path: DEFAULT_MOUNT_PATH.to_string(),
            resources: ResourceBaseline::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl AllocatorConfig {
    /// Host directory backing the volume for `repo_name`
    pub fn host_path_for(&self, repo_name: &str) -> String {
        format!("{}/{}", self.host_path_root.trim_end_matches('/'), repo_name)
    }
}
