//! Command line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use scanq_allocator::config::{
    DEFAULT_ENV_SECRET, DEFAULT_HOST_PATH_ROOT, DEFAULT_IMAGE, DEFAULT_IMAGE_PULL_SECRET,
    DEFAULT_MOUNT_PATH, DEFAULT_NAMESPACE, DEFAULT_STORAGE_CLASS,
};
use scanq_allocator::sizing::DEFAULT_SCM_API_URL;
use scanq_allocator::{AllocatorConfig, ResourceBaseline};
use scanq_common::RetryConfig;

/// scanq - provision an isolated volume, pod and claim per repository scan
#[derive(Parser, Debug)]
#[command(name = "scanq", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// The selected subcommand, `run` with environment defaults when none is given
    pub fn into_command(self) -> Result<Command, clap::Error> {
        match self.command {
            Some(command) => Ok(command),
            None => Cli::try_parse_from(["scanq", "run"])?
                .command
                .ok_or_else(|| clap::Error::new(clap::error::ErrorKind::MissingSubcommand)),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Consume scan requests and provision each one (default)
    Run(RunArgs),

    /// Delete scanq claims and volumes nothing uses any more, then exit
    Reap(ReapArgs),
}

/// Arguments for `scanq run`
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Newline-delimited JSON scan requests; `-` reads stdin
    #[arg(long, short, default_value = "-")]
    pub input: String,

    /// Postgres connection string for the scan_requests table
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Source-control REST API base
    #[arg(long, env = "SCM_API_URL", default_value = DEFAULT_SCM_API_URL)]
    pub scm_api_url: String,

    /// Service token for the source-control API
    #[arg(long, env = "SCM_API_TOKEN", hide_env_values = true)]
    pub scm_token: Option<String>,

    /// Requests provisioned concurrently; 1 keeps arrival order
    #[arg(long, env = "SCANQ_MAX_IN_FLIGHT", default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub max_in_flight: u16,

    /// Attempts per cluster, database or size lookup call
    #[arg(long, env = "SCANQ_RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    /// Postgres pool size
    #[arg(long, env = "SCANQ_DB_MAX_CONNECTIONS", default_value_t = 5)]
    pub db_max_connections: u32,

    #[command(flatten)]
    pub allocator: AllocatorArgs,
}

/// Arguments for `scanq reap`
#[derive(Args, Debug)]
pub struct ReapArgs {
    /// Namespace holding scan pods and claims
    #[arg(long, env = "SCANQ_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Minimum age of an unmounted claim or unbound volume before it is deleted
    #[arg(long, env = "SCANQ_REAP_GRACE_SECS", default_value_t = 600)]
    pub reap_grace_secs: u64,
}

impl ReapArgs {
    /// Grace period as a duration
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.reap_grace_secs)
    }
}

/// Shape of every scan environment
#[derive(Args, Debug, Clone)]
pub struct AllocatorArgs {
    /// Namespace for scan pods and claims
    #[arg(long, env = "SCANQ_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Storage class on volumes and claims
    #[arg(long, env = "SCANQ_STORAGE_CLASS", default_value = DEFAULT_STORAGE_CLASS)]
    pub storage_class: String,

    /// Scanner container image
    #[arg(long, env = "SCANQ_IMAGE", default_value = DEFAULT_IMAGE)]
    pub image: String,

    /// Image pull secret name
    #[arg(long, env = "SCANQ_IMAGE_PULL_SECRET", default_value = DEFAULT_IMAGE_PULL_SECRET)]
    pub image_pull_secret: String,

    /// Secret providing the scanner's DB and vault settings
    #[arg(long, env = "SCANQ_ENV_SECRET", default_value = DEFAULT_ENV_SECRET)]
    pub env_secret: String,

    /// Host directory under which each repository's volume lives
    #[arg(long, env = "SCANQ_HOST_PATH_ROOT", default_value = DEFAULT_HOST_PATH_ROOT)]
    pub host_path_root: String,

    /// Mount path of the scan volume in the container
    #[arg(long, env = "SCANQ_MOUNT_PATH", default_value = DEFAULT_MOUNT_PATH)]
    pub mount_path: String,

    /// Scanner CPU request
    #[arg(long, env = "SCANQ_CPU_REQUEST", default_value = "0.5")]
    pub cpu_request: String,

    /// Scanner memory request
    #[arg(long, env = "SCANQ_MEMORY_REQUEST", default_value = "256Mi")]
    pub memory_request: String,

    /// Scanner CPU limit
    #[arg(long, env = "SCANQ_CPU_LIMIT", default_value = "3")]
    pub cpu_limit: String,

    /// Scanner memory limit
    #[arg(long, env = "SCANQ_MEMORY_LIMIT", default_value = "1Gi")]
    pub memory_limit: String,
}

impl RunArgs {
    /// Where requests come from; `None` is stdin
    pub fn input_path(&self) -> Option<PathBuf> {
        (self.input != "-").then(|| PathBuf::from(&self.input))
    }

    /// Allocator configuration with the requested retry budget
    pub fn allocator_config(&self) -> AllocatorConfig {
        let a = &self.allocator;
        AllocatorConfig {
            namespace: a.namespace.clone(),
            storage_class: a.storage_class.clone(),
            image: a.image.clone(),
            image_pull_secret: a.image_pull_secret.clone(),
            env_secret: a.env_secret.clone(),
            host_path_root: a.host_path_root.clone(),
            mount_path: a.mount_path.clone(),
            resources: ResourceBaseline {
                cpu_request: a.cpu_request.clone(),
                memory_request: a.memory_request.clone(),
                cpu_limit: a.cpu_limit.clone(),
                memory_limit: a.memory_limit.clone(),
            },
            retry: RetryConfig::with_max_attempts(self.retry_attempts),
        }
    }
}
