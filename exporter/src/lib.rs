//! nginxlog-exporter - Prometheus metrics from NGINX access logs
//!
//! Tails access log files, parses each line with a configurable `log_format`
//! and exports request counts, transferred bytes and timing distributions.
//!
//! # Architecture
//!
//! ```text
//! Tailer ──► LineIngestor ──► LabelSchema ──► NamespaceMetrics ──► /metrics
//!   (one per file)          (one per namespace)
//! ```
//!
//! Namespaces are independent: each has its own format, files, label schema
//! and metric family prefix.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod format;
pub mod ingest;
pub mod labels;
pub mod metrics;
pub mod metrics_server;
pub mod namespace;
pub mod summary;
pub mod tail;

pub use config::Config;
pub use error::{ExporterError, ParseError, Result};
pub use namespace::{NamespaceHandle, NamespaceSupervisor};
