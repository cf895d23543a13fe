//! tracerouted entry point.
//!
//! Loads the configuration and a lab fabric description, keeps the topology
//! epoch current from the fabric's change events, and serves trace requests
//! over HTTP until interrupted.

use anyhow::Context;
use clap::Parser;
use sonic_tracerouted::config::DEFAULT_CONFIG_PATH;
use sonic_tracerouted::rest_api;
use sonic_tracerouted::sim::LabFabric;
use sonic_tracerouted::{
    Collaborators, ConfigRegistry, ForwardingMode, TraceService, TracerouteConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// SONiC fabric path discovery daemon
#[derive(Parser, Debug)]
#[command(name = "tracerouted")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Lab fabric description (JSON)
    #[arg(short = 'f', long)]
    fabric: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// REST listen address; overrides the config file
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Probe forwarding mode; overrides the config file
    #[arg(long, value_enum)]
    mode: Option<ForwardingMode>,
}

/// Initialize tracing/logging. RUST_LOG wins over `level`.
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {:?}", level))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")
}

/// Returns the configuration and whether the file was found.
fn load_config(args: &Args) -> anyhow::Result<(TracerouteConfig, bool)> {
    let loaded = TracerouteConfig::load(&args.config)?;
    let found = loaded.is_some();
    let mut config = loaded.unwrap_or_default();
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(listen) = args.listen {
        config.rest.listen_addr = listen;
    }
    if let Some(mode) = args.mode {
        config.trace.forwarding_mode = mode;
    }
    config.validate()?;
    Ok((config, found))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let (config, found) = load_config(&args)?;
    init_logging(&config.log_level)?;

    info!("--- Starting tracerouted ---");
    if !found {
        warn!(path = %args.config.display(), "Config file not found, using defaults");
    }
    info!(
        mode = ?config.trace.forwarding_mode,
        idle_timeout_ms = config.trace.idle_timeout_ms,
        max_restarts = config.trace.max_restarts,
        "Trace settings"
    );

    let (fabric, intercepts, topology_events) =
        LabFabric::from_file(&args.fabric, config.trace.event_queue_depth)
            .with_context(|| format!("loading fabric {}", args.fabric.display()))?;
    info!(fabric = %args.fabric.display(), "Lab fabric loaded");

    let registry = Arc::new(ConfigRegistry::new());
    let watcher = tokio::spawn(registry.clone().watch_topology(topology_events));

    let service = Arc::new(TraceService::new(
        config.trace.clone(),
        Collaborators::from_fabric(fabric),
        registry,
        intercepts,
    ));
    let app = rest_api::router(service, &config.rest.base_path);

    let listener = tokio::net::TcpListener::bind(config.rest.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.rest.listen_addr))?;
    info!(
        addr = %config.rest.listen_addr,
        base = %config.rest.base_path,
        "REST API listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("REST server failed")?;

    watcher.abort();
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("Received SIGINT, shutting down gracefully..."),
        Err(err) => error!("Failed to listen for ctrl-c: {}", err),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => {
            info!("tracerouted shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "tracerouted exiting with error");
            eprintln!("tracerouted: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
