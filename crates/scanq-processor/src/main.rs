//! scanq - per-scan storage and compute provisioning

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use sqlx::postgres::PgPoolOptions;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scanq_allocator::{
    AllocationOrchestrator, GithubSizeLookup, KubeScanClient, OrphanReaper, PgStatusStore,
};
use scanq_common::{init_telemetry, TelemetryConfig};
use scanq_processor::cli::{Cli, Command, ReapArgs, RunArgs};
use scanq_processor::run_feed;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let command = Cli::parse().into_command().unwrap_or_else(|e| e.exit());

    // Flushes exported spans when main returns
    let _telemetry = init_telemetry(TelemetryConfig::default())?;

    match command {
        Command::Run(args) => run(args).await,
        Command::Reap(args) => reap(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = args.allocator_config();
    info!(
        namespace = %config.namespace,
        max_in_flight = args.max_in_flight,
        "Starting scan request processor"
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let pool = PgPoolOptions::new()
        .max_connections(args.db_max_connections)
        .connect(&args.database_url)
        .await
        .context("failed to connect to status database")?;
    let sizes = GithubSizeLookup::new(args.scm_api_url.clone(), args.scm_token.clone())
        .context("failed to build source-control HTTP client")?;

    let orchestrator = AllocationOrchestrator::new(
        Arc::new(sizes),
        Arc::new(KubeScanClient::new(client)),
        Arc::new(PgStatusStore::new(pool.clone())),
        config,
    );

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match args.input_path() {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let summary = run_feed(
        input,
        &orchestrator,
        usize::from(args.max_in_flight),
        cancel,
    )
    .await;

    pool.close().await;
    info!(
        scheduled = summary.scheduled,
        failed = summary.failed,
        malformed = summary.malformed,
        "Processor stopped"
    );
    Ok(())
}

async fn reap(args: ReapArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let reaper = OrphanReaper::new(Arc::new(KubeScanClient::new(client)), args.namespace.clone());
    let report = reaper.sweep(args.grace()).await.context("orphan sweep failed")?;
    if report.failures > 0 {
        anyhow::bail!("{} orphaned objects could not be deleted", report.failures);
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C or SIGTERM
async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown requested, finishing in-flight requests");
    token.cancel();
}
