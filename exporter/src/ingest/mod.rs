//! Line ingestion
//!
//! A [`LineIngestor`] turns lines from one source into metric updates:
//!
//! ```text
//! LineSource ──► LineParser ──► LabelSchema::resolve ──► NamespaceMetrics
//! ```
//!
//! Lines that fail to parse are logged and skipped. Each numeric field is
//! recorded independently, so a missing or `-` value only skips its own
//! metric.

use crate::error::ParseError;
use crate::format::LineParser;
use crate::labels::LabelSchema;
use crate::metrics::NamespaceMetrics;
use crate::tail::LineSource;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const BYTES_FIELD: &str = "body_bytes_sent";
pub const UPSTREAM_TIME_FIELD: &str = "upstream_response_time";
pub const REQUEST_TIME_FIELD: &str = "request_time";

/// Counters for one ingestor run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub parse_errors: u64,
}

/// Processes the lines of one source for one namespace
///
/// Cheap to clone; the parser, schema and metrics are shared.
#[derive(Clone)]
pub struct LineIngestor {
    namespace: Arc<str>,
    source: Arc<str>,
    parser: Arc<LineParser>,
    schema: Arc<LabelSchema>,
    metrics: Arc<NamespaceMetrics>,
}

impl LineIngestor {
    pub fn new(
        namespace: impl Into<Arc<str>>,
        source: impl Into<Arc<str>>,
        parser: Arc<LineParser>,
        schema: Arc<LabelSchema>,
        metrics: Arc<NamespaceMetrics>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            source: source.into(),
            parser,
            schema,
            metrics,
        }
    }

    /// Apply one line to the namespace metrics
    ///
    /// # Errors
    /// Returns the parse error when the line does not match the format; no
    /// metric is touched in that case.
    pub fn process_line(&self, line: &str) -> Result<(), ParseError> {
        let fields = self.parser.parse(line)?;
        let labels = self.schema.resolve(&fields);

        self.metrics.increment_count(&labels);

        if let Ok(bytes) = fields.float(BYTES_FIELD) {
            self.metrics.add_bytes(&labels, bytes);
        }
        if let Ok(seconds) = fields.float(UPSTREAM_TIME_FIELD) {
            self.metrics.observe_upstream(&labels, seconds);
        }
        if let Ok(seconds) = fields.float(REQUEST_TIME_FIELD) {
            self.metrics.observe_response(&labels, seconds);
        }

        Ok(())
    }

    /// Consume `source` until it ends or shutdown is signalled
    ///
    /// Shutdown is only observed between lines, so a line that has started
    /// updating metrics is always applied completely.
    pub async fn run<S: LineSource>(
        &self,
        mut source: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> IngestStats {
        let mut stats = IngestStats::default();
        debug!(namespace = %self.namespace, source = %self.source, "Ingestor started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    info!(namespace = %self.namespace, source = %self.source, "Ingestor stopping");
                    break;
                }
                line = source.next_line() => line,
            };

            let Some(line) = next else {
                info!(namespace = %self.namespace, source = %self.source, "Source exhausted");
                break;
            };

            stats.lines += 1;
            if let Err(e) = self.process_line(&line) {
                stats.parse_errors += 1;
                self.metrics.record_parse_error();
                warn!(
                    namespace = %self.namespace,
                    source = %self.source,
                    error = %e,
                    line = %line,
                    "Failed to parse line"
                );
            }
        }

        stats
    }
}

/// Resolves once shutdown is requested; never if the sender is gone
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
