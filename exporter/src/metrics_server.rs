//! HTTP server for the Prometheus scrape endpoint
//!
//! # Example
//!
//! ```ignore
//! use nginxlog_exporter::metrics_server::MetricsServer;
//!
//! let server = MetricsServer::bind(addr, registry).await?;
//! let handle = server.start(shutdown_rx);
//! ```

use crate::error::{ExporterError, Result};
use crate::metrics::gather;
use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::Registry;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Metrics HTTP server
pub struct MetricsServer {
    listener: TcpListener,
    registry: Registry,
}

impl MetricsServer {
    /// Bind the listening socket
    ///
    /// Binding happens before anything is served so that a taken port fails
    /// startup instead of a background task.
    ///
    /// # Errors
    /// Returns `ExporterError::Config` if the address cannot be bound
    pub async fn bind(addr: SocketAddr, registry: Registry) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ExporterError::Config(format!("failed to bind metrics server on {addr}: {e}"))
        })?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Routes served by the exporter
    pub fn router(registry: Registry) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(registry)
    }

    /// Serve until `shutdown` turns true or its sender is dropped
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let app = Self::router(self.registry);
        let listener = self.listener;

        tokio::spawn(async move {
            if let Ok(addr) = listener.local_addr() {
                info!(%addr, "Metrics server listening");
            }

            let stop = async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
                error!(error = %e, "Metrics server error");
            }
        })
    }
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(registry): State<Registry>) -> impl IntoResponse {
    let body = gather(&registry);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Handler for /health endpoint
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
