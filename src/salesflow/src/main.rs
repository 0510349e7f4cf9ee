//! Salesflow, the journey execution engine server.
//!
//! Wires the in-memory journey runtime, starts the dispatcher workers, the
//! metrics exporter and the REST API.

use clap::Parser;
use salesflow_api::ApiServer;
use salesflow_core::config::AppConfig;
use salesflow_core::event_bus::noop_sink;
use salesflow_journey::JourneyRuntime;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "salesflow")]
#[command(about = "Per-contact journey automation engine")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, short, env = "SALESFLOW_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "SALESFLOW__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "SALESFLOW__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Dispatcher worker count (overrides config)
    #[arg(long, env = "SALESFLOW__JOURNEY__SCHEDULER__WORKERS")]
    workers: Option<usize>,

    /// Serve the API without running the dispatcher
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "salesflow=info,salesflow_journey=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Salesflow starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(workers) = cli.workers {
        config.journey.scheduler.workers = workers;
    }
    if cli.api_only {
        config.journey.scheduler.enabled = false;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        workers = config.journey.scheduler.workers,
        dispatcher = config.journey.scheduler.enabled,
        "Configuration loaded"
    );

    let runtime = Arc::new(JourneyRuntime::in_memory(&config.journey, noop_sink()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = if config.journey.scheduler.enabled {
        let handles = runtime
            .dispatcher
            .spawn_workers(config.journey.scheduler.workers, shutdown_rx.clone());
        info!(workers = handles.len(), "Dispatcher started");
        handles
    } else {
        info!("Running in API-only mode (no dispatcher)");
        Vec::new()
    };

    let api_server = ApiServer::new(config.clone(), runtime.clone());

    if config.metrics.enabled {
        if let Err(e) = api_server.start_metrics().await {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    info!("Salesflow is ready to serve traffic");

    // Blocks until shutdown
    api_server.start_http(shutdown_rx).await?;

    for handle in workers {
        if let Err(e) = handle.await {
            error!(error = %e, "Dispatcher worker panicked");
        }
    }

    info!("Salesflow stopped");
    Ok(())
}
