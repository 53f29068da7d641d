use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use effpol_core::{BatchMetrics, BatchResolver, FanOutExecutor, LoggingMetricsBackend};
use effpol_server::{AppState, EffpolConfig, serve};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(
    name = "effpol",
    about = "effpol — resolves batches of effective Org Policies for remote function calls"
)]
struct Cli {
    /// Path to effpol.toml (defaults to ./effpol.toml, then the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overrides server.bind
    #[arg(long)]
    bind: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_env("EFFPOL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let (config, source) =
        EffpolConfig::discover(cli.config.as_deref()).context("failed to load effpol config")?;
    match &source {
        Some(path) => tracing::info!(path = %path.display(), "Loaded config"),
        None => tracing::info!("No effpol.toml found, using defaults"),
    }

    let limiter = Arc::new(config.build_limiter().context("invalid rate_limit config")?);
    let metrics = Arc::new(BatchMetrics::with_backend(Arc::new(LoggingMetricsBackend)));
    let provider = config.build_provider().context("invalid lookup config")?;
    let executor = FanOutExecutor::new(limiter).with_metrics(metrics);
    let resolver = BatchResolver::new(provider, executor);

    let addr = config
        .bind_addr(cli.bind.as_deref())
        .context("invalid bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to bind {addr}"))?;

    let limiter = resolver.executor().limiter();
    tracing::info!(
        addr = %addr,
        rate_per_second = limiter.rate_per_second(),
        burst_size = limiter.burst_size(),
        provider = ?config.lookup.provider,
        "Starting effpol server"
    );

    serve(listener, AppState::new(resolver), shutdown_signal())
        .await
        .context("server terminated")?;

    tracing::info!("effpol server shut down");
    Ok(())
}
