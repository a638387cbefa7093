//! Prometheus metrics for one namespace
//!
//! Each namespace owns a [`NamespaceMetrics`] registered into an explicitly
//! passed [`Registry`]. All vectors are internally synchronized, so any number
//! of ingestors can update them through a shared reference.

use crate::error::{ExporterError, Result};
use crate::labels::LabelValues;
use crate::summary::{SummaryOpts, SummaryVec};
use prometheus::core::Collector;
use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

/// All metrics of one namespace
pub struct NamespaceMetrics {
    label_names: Vec<String>,

    /// Processed requests
    count_total: CounterVec,

    /// Transferred bytes
    bytes_total: CounterVec,

    /// Upstream handling time
    upstream_seconds: SummaryVec,
    upstream_seconds_hist: HistogramVec,

    /// Total request handling time
    response_seconds: SummaryVec,
    response_seconds_hist: HistogramVec,

    /// Lines that did not match the namespace format
    parse_errors: Counter,
}

impl NamespaceMetrics {
    /// Create the namespace metrics and register them
    ///
    /// `label_names` fixes the arity of every vector. `buckets` defaults to
    /// the registry default buckets.
    ///
    /// # Errors
    /// Returns `ExporterError::Metrics` if a metric cannot be created or
    /// collides with one already in `registry`.
    pub fn register(
        namespace: &str,
        label_names: &[String],
        buckets: Option<Vec<f64>>,
        registry: &Registry,
    ) -> Result<Self> {
        let labels: Vec<&str> = label_names.iter().map(String::as_str).collect();
        let buckets = buckets.unwrap_or_else(|| prometheus::DEFAULT_BUCKETS.to_vec());
        let err = |metric: &str, e: prometheus::Error| {
            ExporterError::Metrics(format!("{namespace}_{metric}: {e}"))
        };

        let metrics = Self {
            label_names: label_names.to_vec(),

            count_total: CounterVec::new(
                Opts::new("http_response_count_total", "Amount of processed HTTP requests")
                    .namespace(namespace),
                &labels,
            )
            .map_err(|e| err("http_response_count_total", e))?,

            bytes_total: CounterVec::new(
                Opts::new("http_response_size_bytes", "Total amount of transferred bytes")
                    .namespace(namespace),
                &labels,
            )
            .map_err(|e| err("http_response_size_bytes", e))?,

            upstream_seconds: SummaryVec::new(
                SummaryOpts::new(
                    "http_upstream_time_seconds",
                    "Time needed by upstream servers to handle requests",
                )
                .namespace(namespace),
                &labels,
            )
            .map_err(|e| err("http_upstream_time_seconds", e))?,

            upstream_seconds_hist: HistogramVec::new(
                HistogramOpts::new(
                    "http_upstream_time_seconds_hist",
                    "Time needed by upstream servers to handle requests",
                )
                .namespace(namespace)
                .buckets(buckets.clone()),
                &labels,
            )
            .map_err(|e| err("http_upstream_time_seconds_hist", e))?,

            response_seconds: SummaryVec::new(
                SummaryOpts::new(
                    "http_response_time_seconds",
                    "Time needed by NGINX to handle requests",
                )
                .namespace(namespace),
                &labels,
            )
            .map_err(|e| err("http_response_time_seconds", e))?,

            response_seconds_hist: HistogramVec::new(
                HistogramOpts::new(
                    "http_response_time_seconds_hist",
                    "Time needed by NGINX to handle requests",
                )
                .namespace(namespace)
                .buckets(buckets),
                &labels,
            )
            .map_err(|e| err("http_response_time_seconds_hist", e))?,

            parse_errors: Counter::with_opts(
                Opts::new(
                    "parse_errors_total",
                    "Total number of log lines that could not be parsed",
                )
                .namespace(namespace),
            )
            .map_err(|e| err("parse_errors_total", e))?,
        };

        registry
            .register(Box::new(metrics.count_total.clone()))
            .map_err(|e| err("http_response_count_total", e))?;
        registry
            .register(Box::new(metrics.bytes_total.clone()))
            .map_err(|e| err("http_response_size_bytes", e))?;
        registry
            .register(Box::new(metrics.upstream_seconds.clone()))
            .map_err(|e| err("http_upstream_time_seconds", e))?;
        registry
            .register(Box::new(metrics.upstream_seconds_hist.clone()))
            .map_err(|e| err("http_upstream_time_seconds_hist", e))?;
        registry
            .register(Box::new(metrics.response_seconds.clone()))
            .map_err(|e| err("http_response_time_seconds", e))?;
        registry
            .register(Box::new(metrics.response_seconds_hist.clone()))
            .map_err(|e| err("http_response_time_seconds_hist", e))?;
        registry
            .register(Box::new(metrics.parse_errors.clone()))
            .map_err(|e| err("parse_errors_total", e))?;

        Ok(metrics)
    }

    /// Count one request
    ///
    /// Label values whose arity differs from the registered names are
    /// dropped with a warning, never a panic; the same holds for every
    /// recording method below.
    pub fn increment_count(&self, labels: &LabelValues) {
        match self.count_total.get_metric_with_label_values(&labels.as_strs()) {
            Ok(counter) => counter.inc(),
            Err(e) => warn!(error = %e, "Dropped request count"),
        }
    }

    /// Add transferred bytes; negative amounts are ignored
    pub fn add_bytes(&self, labels: &LabelValues, amount: f64) {
        if amount < 0.0 {
            return;
        }
        match self.bytes_total.get_metric_with_label_values(&labels.as_strs()) {
            Ok(counter) => counter.inc_by(amount),
            Err(e) => warn!(error = %e, "Dropped transferred bytes"),
        }
    }

    /// Record upstream time in both the summary and the histogram
    pub fn observe_upstream(&self, labels: &LabelValues, seconds: f64) {
        let values = labels.as_strs();
        if let Err(e) = self.upstream_seconds.observe(&values, seconds) {
            warn!(error = %e, "Dropped upstream time observation");
        }
        match self.upstream_seconds_hist.get_metric_with_label_values(&values) {
            Ok(histogram) => histogram.observe(seconds),
            Err(e) => warn!(error = %e, "Dropped upstream time observation"),
        }
    }

    /// Record response time in both the summary and the histogram
    pub fn observe_response(&self, labels: &LabelValues, seconds: f64) {
        let values = labels.as_strs();
        if let Err(e) = self.response_seconds.observe(&values, seconds) {
            warn!(error = %e, "Dropped response time observation");
        }
        match self.response_seconds_hist.get_metric_with_label_values(&values) {
            Ok(histogram) => histogram.observe(seconds),
            Err(e) => warn!(error = %e, "Dropped response time observation"),
        }
    }

    /// Count a line that did not parse
    pub fn record_parse_error(&self) {
        self.parse_errors.inc();
    }

    /// Requests counted so far for one label set
    pub fn count(&self, labels: &LabelValues) -> f64 {
        self.counter_value(&self.count_total, labels)
    }

    /// Bytes counted so far for one label set
    pub fn bytes(&self, labels: &LabelValues) -> f64 {
        self.counter_value(&self.bytes_total, labels)
    }

    /// Current value without creating the series
    fn counter_value(&self, vec: &CounterVec, labels: &LabelValues) -> f64 {
        vec.collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .find(|metric| {
                let pairs = metric.get_label();
                pairs.len() == labels.len()
                    && pairs.iter().all(|pair| {
                        self.label_names
                            .iter()
                            .position(|name| name == pair.get_name())
                            .and_then(|i| labels.get(i))
                            == Some(pair.get_value())
                    })
            })
            .map_or(0.0, |metric| metric.get_counter().get_value())
    }

    pub fn parse_errors(&self) -> f64 {
        self.parse_errors.get()
    }
}

/// Gather all metrics of a registry and encode them as Prometheus text
///
/// Reading never resets or otherwise mutates metric state.
pub fn gather(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}
