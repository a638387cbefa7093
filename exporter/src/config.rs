//! Configuration for the exporter
//!
//! Configuration comes either from a TOML file (`--config-file`) or, for the
//! single-namespace case, straight from command line flags.
//!
//! ```toml
//! enable_experimental = true
//!
//! [listen]
//! port = 4040
//! address = "0.0.0.0"
//!
//! [[namespaces]]
//! name = "app1"
//! format = "$remote_addr - $remote_user [$time_local] \"$request\" $status $body_bytes_sent"
//! source_files = ["/var/log/nginx/app1/access.log"]
//! routes = ["^/users/[0-9]+", { pattern = "^/api", name = "api" }]
//!
//! [namespaces.labels]
//! app = "application-one"
//!
//! [[namespaces.relabel_configs]]
//! target_label = "user"
//! from = "remote_user"
//! whitelist = ["-", "admin"]
//! ```

use crate::error::{ExporterError, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default access log format (nginx "combined" plus forwarded-for)
pub const DEFAULT_FORMAT: &str = r#"$remote_addr - $remote_user [$time_local] "$request" $status $body_bytes_sent "$http_referer" "$http_user_agent" "$http_x_forwarded_for""#;

/// Command line flags
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct StartupFlags {
    /// HTTP port to listen on
    #[arg(long, env = "NGINXLOG_EXPORTER_LISTEN_PORT", default_value_t = 4040)]
    pub listen_port: u16,

    /// HTTP address to listen on
    #[arg(long, env = "NGINXLOG_EXPORTER_LISTEN_ADDRESS", default_value = "0.0.0.0")]
    pub listen_address: String,

    /// Access log format
    #[arg(long, default_value = DEFAULT_FORMAT)]
    pub format: String,

    /// Namespace to use for metric names
    #[arg(long, env = "NGINXLOG_EXPORTER_NAMESPACE", default_value = "nginx")]
    pub namespace: String,

    /// Configuration file to read from
    #[arg(long, env = "NGINXLOG_EXPORTER_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Enable experimental features
    #[arg(long)]
    pub enable_experimental: bool,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "NGINXLOG_EXPORTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format
    #[arg(long, env = "NGINXLOG_EXPORTER_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log files to tail
    pub filenames: Vec<PathBuf>,
}

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Scrape endpoint listener
    pub listen: ListenConfig,

    /// Consul service registration
    pub consul: ConsulConfig,

    /// Independently configured log sources
    pub namespaces: Vec<NamespaceConfig>,

    /// Opt-in for options marked experimental
    pub enable_experimental: bool,

    /// How often tailed files are checked for new data
    pub poll_interval_ms: u64,

    /// Log level
    pub log_level: String,

    /// Log format (json or pretty)
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    pub port: u16,
    pub address: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: 4040,
            address: "0.0.0.0".to_string(),
        }
    }
}

impl ListenConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.address, self.port)
            .parse()
            .map_err(|e| {
                ExporterError::Config(format!(
                    "invalid listen address {}:{}: {e}",
                    self.address, self.port
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsulConfig {
    pub enable: bool,
    /// Agent address, `host:port`
    pub address: String,
    pub scheme: String,
    pub datacenter: Option<String>,
    pub token: Option<String>,
    pub service: ConsulServiceConfig,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            enable: false,
            address: "localhost:8500".to_string(),
            scheme: "http".to_string(),
            datacenter: None,
            token: None,
            service: ConsulServiceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsulServiceConfig {
    pub id: String,
    pub name: String,
    /// Address advertised to consul; the agent's own address when unset
    pub address: Option<String>,
    pub tags: Vec<String>,
}

impl Default for ConsulServiceConfig {
    fn default() -> Self {
        Self {
            id: "nginx-exporter".to_string(),
            name: "nginx-exporter".to_string(),
            address: None,
            tags: Vec::new(),
        }
    }
}

/// One log source with its own grammar, files and label schema
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamespaceConfig {
    pub name: String,

    #[serde(default = "default_format")]
    pub format: String,

    pub source_files: Vec<PathBuf>,

    /// Static labels, emitted in name order
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub relabel_configs: Vec<RelabelConfig>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Histogram buckets for both timing histograms
    #[serde(default)]
    pub histogram_buckets: Option<Vec<f64>>,
}

fn default_format() -> String {
    DEFAULT_FORMAT.to_string()
}

/// Maps a parsed field to a label, optionally bounded by a whitelist
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelabelConfig {
    pub target_label: String,
    /// Source field name
    pub from: String,
    #[serde(default)]
    pub whitelist: Vec<String>,
}

/// Route classification rule
///
/// Written either as a bare pattern (the pattern doubles as the route name)
/// or as a table with `pattern` and `name`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RouteEntry")]
pub struct RouteConfig {
    pub pattern: String,
    pub name: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RouteEntry {
    Pattern(String),
    Named {
        pattern: String,
        name: Option<String>,
    },
}

impl From<RouteEntry> for RouteConfig {
    fn from(entry: RouteEntry) -> Self {
        match entry {
            RouteEntry::Pattern(pattern) => Self {
                name: pattern.clone(),
                pattern,
            },
            RouteEntry::Named { pattern, name } => Self {
                name: name.unwrap_or_else(|| pattern.clone()),
                pattern,
            },
        }
    }
}

impl RouteConfig {
    pub fn new(pattern: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            name: name.into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            consul: ConsulConfig::default(),
            namespaces: Vec::new(),
            enable_experimental: false,
            poll_interval_ms: 250,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExporterError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml(&content)
            .map_err(|e| ExporterError::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| ExporterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a single-namespace configuration from command line flags
    pub fn from_flags(flags: &StartupFlags) -> Result<Self> {
        let config = Config {
            listen: ListenConfig {
                port: flags.listen_port,
                address: flags.listen_address.clone(),
            },
            namespaces: vec![NamespaceConfig {
                name: flags.namespace.clone(),
                format: flags.format.clone(),
                source_files: flags.filenames.clone(),
                labels: BTreeMap::new(),
                relabel_configs: Vec::new(),
                routes: Vec::new(),
                histogram_buckets: None,
            }],
            ..Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply flag values that take precedence over the file
    pub fn apply_flags(&mut self, flags: &StartupFlags) {
        self.enable_experimental |= flags.enable_experimental;
        if let Some(level) = &flags.log_level {
            self.log_level = level.clone();
        }
        if let Some(format) = flags.log_format {
            self.log_format = format;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Structural validation; label schemas are checked when compiled
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(ExporterError::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for ns in &self.namespaces {
            ns.validate()?;
            if !seen.insert(ns.name.as_str()) {
                return Err(ExporterError::Config(format!(
                    "duplicate namespace '{}'",
                    ns.name
                )));
            }
        }

        if self.consul.enable && self.consul.service.id.is_empty() {
            return Err(ExporterError::Config(
                "consul.service.id must be set when consul is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Name of the first option that needs `enable_experimental`, if any
    pub fn stability_warnings(&self) -> Option<String> {
        if self.enable_experimental {
            return None;
        }
        self.namespaces
            .iter()
            .find(|ns| !ns.relabel_configs.is_empty())
            .map(|ns| format!("namespace '{}' uses 'relabel_configs'", ns.name))
    }
}

impl NamespaceConfig {
    fn validate(&self) -> Result<()> {
        if !is_valid_metric_prefix(&self.name) {
            return Err(ExporterError::Config(format!(
                "invalid namespace name '{}'",
                self.name
            )));
        }
        if self.format.trim().is_empty() {
            return Err(ExporterError::Config(format!(
                "namespace '{}': format must not be empty",
                self.name
            )));
        }
        if self.source_files.is_empty() {
            return Err(ExporterError::Config(format!(
                "namespace '{}': no source files configured",
                self.name
            )));
        }
        if let Some(buckets) = &self.histogram_buckets {
            let valid = !buckets.is_empty()
                && buckets.iter().all(|b| b.is_finite() && *b > 0.0)
                && buckets.windows(2).all(|w| w[0] < w[1]);
            if !valid {
                return Err(ExporterError::Config(format!(
                    "namespace '{}': histogram_buckets must be positive and strictly ascending",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

fn is_valid_metric_prefix(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
