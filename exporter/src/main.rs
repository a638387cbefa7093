//! nginxlog-exporter - Prometheus metrics from NGINX access logs
//!
//! ## Usage
//!
//! ```bash
//! # Single namespace straight from flags
//! nginxlog-exporter --format '$remote_addr "$request" $status' /var/log/nginx/access.log
//!
//! # Multiple namespaces from a config file
//! nginxlog-exporter --config-file /etc/nginxlog-exporter.toml
//! ```
//!
//! ## Environment Variables
//!
//! - `NGINXLOG_EXPORTER_LISTEN_PORT`: scrape port (default: 4040)
//! - `NGINXLOG_EXPORTER_LISTEN_ADDRESS`: scrape address (default: "0.0.0.0")
//! - `NGINXLOG_EXPORTER_NAMESPACE`: namespace when running from flags (default: "nginx")
//! - `NGINXLOG_EXPORTER_CONFIG_FILE`: TOML config file
//! - `NGINXLOG_EXPORTER_LOG_LEVEL`: log level (default: "info")
//! - `NGINXLOG_EXPORTER_LOG_FORMAT`: `pretty` or `json`
//! - `RUST_LOG`: overrides the log level with a full filter directive

use clap::Parser;
use nginxlog_exporter::config::{Config, LogFormat, StartupFlags};
use nginxlog_exporter::discovery::{ConsulRegistrator, DiscoveryLifecycle};
use nginxlog_exporter::metrics_server::MetricsServer;
use nginxlog_exporter::namespace::NamespaceSupervisor;
use nginxlog_exporter::tail::TailConfig;
use prometheus::Registry;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = StartupFlags::parse();

    // Load configuration
    let mut config = match &flags.config_file {
        Some(path) => Config::from_file(path)?,
        None => Config::from_flags(&flags)?,
    };
    config.apply_flags(&flags);

    init_tracing(&config);

    if let Some(warning) = config.stability_warnings() {
        eprintln!(
            "Your configuration enables an experimental feature ({warning}). \
             Pass --enable-experimental or set enable_experimental = true to use it."
        );
        std::process::exit(1);
    }

    info!(
        listen = %format!("{}:{}", config.listen.address, config.listen.port),
        namespaces = config.namespaces.len(),
        consul = config.consul.enable,
        "Starting nginxlog-exporter"
    );

    let registry = Registry::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start all namespaces; any failure aborts startup
    let tail = TailConfig {
        poll_interval: config.poll_interval(),
        ..TailConfig::default()
    };
    let namespaces = NamespaceSupervisor::start_all(
        config.namespaces.clone(),
        &registry,
        tail,
        shutdown_rx.clone(),
    )
    .await?;

    let server = MetricsServer::bind(config.listen.socket_addr()?, registry.clone()).await?;
    let server_handle = server.start(shutdown_rx.clone());

    // Announce only once metrics are being served
    let mut discovery = None;
    if config.consul.enable {
        let registrator = ConsulRegistrator::new(&config.consul, config.listen.port)?;
        let mut lifecycle = DiscoveryLifecycle::new(Arc::new(registrator));
        if let Err(e) = lifecycle.register().await {
            let _ = shutdown_tx.send(true);
            return Err(e.into());
        }
        discovery = Some(lifecycle);
    }

    shutdown_signal().await;

    if let Some(lifecycle) = discovery.as_mut() {
        lifecycle.shutdown().await;
    }

    let _ = shutdown_tx.send(true);
    for namespace in namespaces {
        namespace.join().await;
    }
    if let Err(e) = server_handle.await {
        error!(error = %e, "Metrics server task failed");
    }

    info!("nginxlog-exporter shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let (json, pretty) = match config.log_format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
