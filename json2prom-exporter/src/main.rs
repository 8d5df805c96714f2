//! Prometheus exporter for JSON HTTP endpoints.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use json2prom_common::init_tracing;
use json2prom_exporter::{
    ExporterConfig, HttpServer, SeriesRegistry, Supervisor, TargetErrorPolicy,
};

/// Prometheus exporter for JSON HTTP endpoints.
#[derive(Parser, Debug)]
#[command(name = "json2prom")]
#[command(about = "Poll JSON endpoints and expose the extracted values as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (YAML or JSON5).
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Authorization header value for targets with includeAuthHeader.
    #[arg(long, env = "AUTH_HEADER", hide_env_values = true)]
    auth_header: Option<String>,

    /// Log level (trace, debug, info, warn, error). Overrides config.
    #[arg(long)]
    log_level: Option<String>,

    /// Exit if any target fails to initialize.
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ExporterConfig::load_from_file(&args.config)?;

    if let Some(listen) = args.listen {
        config.prometheus.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.strict {
        config.target_errors = TargetErrorPolicy::Abort;
    }
    config.validate()?;

    init_tracing(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        targets = config.targets.len(),
        "Starting json2prom"
    );

    let registry = Arc::new(SeriesRegistry::new(
        config.prometheus.self_metrics_prefix.clone(),
        config.series.clone(),
    ));

    let mut supervisor = Supervisor::new(
        registry.clone(),
        args.auth_header,
        config.target_errors,
    )?;
    supervisor.start(&config.targets)?;

    let listen_addr: SocketAddr = config
        .prometheus
        .listen
        .parse()
        .context("Invalid listen address")?;

    let server = match HttpServer::new(
        registry.clone(),
        listen_addr,
        config.prometheus.path.clone(),
    )
    .bind()
    .await
    {
        Ok(server) => server,
        Err(e) => {
            supervisor.shutdown(config.shutdown_grace()).await;
            return Err(e.into());
        }
    };

    let mut http_task = tokio::spawn(server.serve(supervisor.subscribe()));

    // The server only returns on its own if it failed.
    let early_exit = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut http_task => Some(result),
    };
    if early_exit.is_some() {
        error!("HTTP server stopped unexpectedly, shutting down");
    }

    let grace = config.shutdown_grace();
    let drained = supervisor.shutdown(grace).await;

    let exposition = match early_exit {
        Some(result) => result,
        None => match tokio::time::timeout(grace, &mut http_task).await {
            Ok(result) => result,
            Err(_) => {
                http_task.abort();
                Ok(Ok(()))
            }
        },
    };

    let stats = registry.stats();
    info!(
        series_count = registry.series_count(),
        series_created = stats.series_created,
        series_retired = stats.series_retired,
        series_dropped = stats.series_dropped,
        drained,
        "Final statistics"
    );

    match exposition {
        Ok(Ok(())) => {
            info!("Exporter stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
