//! Namespace supervision
//!
//! Starting a namespace compiles its label schema, registers its metrics and
//! opens every source file before a single ingestor is spawned. Any failure
//! along the way aborts the namespace as a whole.
//!
//! ```text
//!                 ┌──► LineIngestor (file 1) ──┐
//! Supervisor ─────┼──► LineIngestor (file 2) ──┼──► NamespaceMetrics
//!                 └──► LineIngestor (file N) ──┘
//! ```

use crate::config::NamespaceConfig;
use crate::error::{ExporterError, Result};
use crate::format::LineParser;
use crate::ingest::{IngestStats, LineIngestor};
use crate::labels::LabelSchema;
use crate::metrics::NamespaceMetrics;
use crate::tail::{LineSource, TailConfig, Tailer};
use prometheus::Registry;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Starts namespaces
pub struct NamespaceSupervisor;

impl NamespaceSupervisor {
    /// Start one namespace, tailing all of its configured files
    pub async fn start(
        cfg: NamespaceConfig,
        registry: &Registry,
        tail: TailConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<NamespaceHandle> {
        let mut sources = Vec::with_capacity(cfg.source_files.len());
        for path in &cfg.source_files {
            let tailer = Tailer::open(path, tail).await?;
            sources.push((path.display().to_string(), tailer));
        }
        Self::start_with_sources(cfg, registry, sources, shutdown)
    }

    /// Start one namespace over already opened sources
    ///
    /// The schema is compiled and the metrics registered before any source
    /// is consumed.
    pub fn start_with_sources<S>(
        cfg: NamespaceConfig,
        registry: &Registry,
        sources: Vec<(String, S)>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<NamespaceHandle>
    where
        S: LineSource + 'static,
    {
        let schema = Arc::new(LabelSchema::compile(&cfg)?);
        let parser = Arc::new(LineParser::new(&cfg.format)?);
        let metrics = Arc::new(NamespaceMetrics::register(
            &cfg.name,
            schema.names(),
            cfg.histogram_buckets.clone(),
            registry,
        )?);

        info!(
            namespace = %cfg.name,
            labels = ?schema.names(),
            routes = schema.has_routes(),
            sources = sources.len(),
            "Starting namespace"
        );
        debug!(namespace = %cfg.name, format = parser.format(), "Compiled line format");

        let name: Arc<str> = Arc::from(cfg.name.as_str());
        let mut tasks = JoinSet::new();
        for (source_name, source) in sources {
            let ingestor = LineIngestor::new(
                Arc::clone(&name),
                source_name.as_str(),
                Arc::clone(&parser),
                Arc::clone(&schema),
                Arc::clone(&metrics),
            );
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let stats = ingestor.run(source, shutdown).await;
                (source_name, stats)
            });
        }

        Ok(NamespaceHandle {
            name: cfg.name,
            metrics,
            tasks,
        })
    }

    /// Start all namespaces concurrently
    ///
    /// Fails if any namespace fails to start.
    pub async fn start_all(
        configs: Vec<NamespaceConfig>,
        registry: &Registry,
        tail: TailConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<NamespaceHandle>> {
        let mut starting = JoinSet::new();
        for cfg in configs {
            let registry = registry.clone();
            let shutdown = shutdown.clone();
            starting.spawn(async move { Self::start(cfg, &registry, tail, shutdown).await });
        }

        let mut handles = Vec::with_capacity(starting.len());
        while let Some(joined) = starting.join_next().await {
            let handle = joined.map_err(|e| {
                ExporterError::Config(format!("namespace startup task failed: {e}"))
            })??;
            handles.push(handle);
        }
        Ok(handles)
    }
}

/// A running namespace
pub struct NamespaceHandle {
    name: String,
    metrics: Arc<NamespaceMetrics>,
    tasks: JoinSet<(String, IngestStats)>,
}

impl NamespaceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &Arc<NamespaceMetrics> {
        &self.metrics
    }

    /// Number of ingestors still running
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every ingestor to finish
    pub async fn join(mut self) -> Vec<(String, IngestStats)> {
        let mut finished = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(result) => finished.push(result),
                Err(e) => error!(namespace = %self.name, error = %e, "Ingestor task failed"),
            }
        }
        info!(namespace = %self.name, "Namespace stopped");
        finished
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{RelabelConfig, RouteConfig};
    use crate::labels::LabelValues;
    use crate::metrics::gather;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    const FORMAT: &str = r#"$remote_user "$request" $status $body_bytes_sent"#;

    fn cfg(name: &str) -> NamespaceConfig {
        NamespaceConfig {
            name: name.to_string(),
            format: FORMAT.to_string(),
            source_files: vec![PathBuf::from("/dev/null")],
            labels: BTreeMap::new(),
            relabel_configs: Vec::new(),
            routes: Vec::new(),
            histogram_buckets: None,
        }
    }

    fn labels(values: &[&str]) -> LabelValues {
        values
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .into()
    }

    #[tokio::test]
    async fn test_concurrent_sources_share_metrics() {
        let registry = Registry::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let sources = 4;
        let lines_per_source = 250;
        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..sources {
            let (tx, rx) = mpsc::channel(16);
            senders.push(tx);
            receivers.push((format!("source-{i}"), rx));
        }

        let handle =
            NamespaceSupervisor::start_with_sources(cfg("web"), &registry, receivers, stop_rx)
                .unwrap();
        assert_eq!(handle.running(), sources);

        for tx in senders {
            tokio::spawn(async move {
                for _ in 0..lines_per_source {
                    tx.send(r#"- "GET / HTTP/1.1" 200 1"#.to_string())
                        .await
                        .unwrap();
                }
            });
        }

        let metrics = Arc::clone(handle.metrics());
        let stats = handle.join().await;
        assert_eq!(stats.len(), sources);

        let expected = (sources * lines_per_source) as f64;
        assert_eq!(metrics.count(&labels(&["GET", "200"])), expected);
        assert_eq!(metrics.bytes(&labels(&["GET", "200"])), expected);
    }

    #[tokio::test]
    async fn test_namespaces_do_not_cross_contaminate() {
        let registry = Registry::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let (tx_a, rx_a) = mpsc::channel(4);
        let (tx_b, rx_b) = mpsc::channel(4);
        let a = NamespaceSupervisor::start_with_sources(
            cfg("alpha"),
            &registry,
            vec![("a".to_string(), rx_a)],
            stop_rx.clone(),
        )
        .unwrap();
        let b = NamespaceSupervisor::start_with_sources(
            cfg("beta"),
            &registry,
            vec![("b".to_string(), rx_b)],
            stop_rx,
        )
        .unwrap();

        tx_a.send(r#"- "GET / HTTP/1.1" 200 1"#.to_string())
            .await
            .unwrap();
        tx_b.send(r#"- "POST / HTTP/1.1" 500 1"#.to_string())
            .await
            .unwrap();
        drop((tx_a, tx_b));

        let (ma, mb) = (Arc::clone(a.metrics()), Arc::clone(b.metrics()));
        a.join().await;
        b.join().await;

        assert_eq!(ma.count(&labels(&["GET", "200"])), 1.0);
        assert_eq!(ma.count(&labels(&["POST", "500"])), 0.0);
        assert_eq!(mb.count(&labels(&["POST", "500"])), 1.0);

        let text = gather(&registry);
        assert!(text.contains(r#"alpha_http_response_count_total{method="GET",status="200"} 1"#));
        assert!(text.contains(r#"beta_http_response_count_total{method="POST",status="500"} 1"#));
        assert!(!text.contains(r#"alpha_http_response_count_total{method="POST""#));
    }

    #[tokio::test]
    async fn test_full_schema_through_supervisor() {
        let registry = Registry::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let mut config = cfg("shop");
        config.labels.insert("env".into(), "prod".into());
        config.relabel_configs.push(RelabelConfig {
            target_label: "user".into(),
            from: "remote_user".into(),
            whitelist: vec!["alice".into()],
        });
        config.routes.push(RouteConfig::new("^/api", "api"));

        let (tx, rx) = mpsc::channel(4);
        let handle = NamespaceSupervisor::start_with_sources(
            config,
            &registry,
            vec![("mem".to_string(), rx)],
            stop_rx,
        )
        .unwrap();

        tx.send(r#"bob "GET /api/v1 HTTP/1.1" 200 5"#.to_string())
            .await
            .unwrap();
        tx.send(r#"alice "GET /home HTTP/1.1" 200 5"#.to_string())
            .await
            .unwrap();
        drop(tx);
        handle.join().await;

        let text = gather(&registry);
        assert!(text.contains(
            r#"shop_http_response_count_total{env="prod",method="GET",request_uri="api",status="200",user="other"} 1"#
        ));
        assert!(text.contains(
            r#"shop_http_response_count_total{env="prod",method="GET",request_uri="",status="200",user="alice"} 1"#
        ));
    }

    #[tokio::test]
    async fn test_duplicate_namespace_is_fatal() {
        let registry = Registry::new();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let none: Vec<(String, mpsc::Receiver<String>)> = Vec::new();

        NamespaceSupervisor::start_with_sources(cfg("dup"), &registry, none, stop_rx.clone())
            .unwrap();
        let second = NamespaceSupervisor::start_with_sources(
            cfg("dup"),
            &registry,
            Vec::<(String, mpsc::Receiver<String>)>::new(),
            stop_rx,
        );
        assert!(matches!(second, Err(ExporterError::Metrics(_))));
    }

    #[tokio::test]
    async fn test_unreadable_file_is_fatal() {
        let registry = Registry::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let mut config = cfg("files");
        config.source_files = vec![PathBuf::from("/definitely/not/here.log")];
        let result =
            NamespaceSupervisor::start(config, &registry, TailConfig::default(), stop_rx).await;

        assert!(matches!(result, Err(ExporterError::Tail { .. })));
        assert!(!gather(&registry).contains("files_http_response_count_total"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_ingestors() {
        let registry = Registry::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        let (_tx1, rx1) = mpsc::channel::<String>(1);
        let (_tx2, rx2) = mpsc::channel::<String>(1);
        let handle = NamespaceSupervisor::start_with_sources(
            cfg("stop"),
            &registry,
            vec![("1".to_string(), rx1), ("2".to_string(), rx2)],
            stop_rx,
        )
        .unwrap();

        stop_tx.send(true).unwrap();
        let stats = tokio::time::timeout(std::time::Duration::from_secs(5), handle.join())
            .await
            .unwrap();
        assert_eq!(stats.len(), 2);
    }
}
