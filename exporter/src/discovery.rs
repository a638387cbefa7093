//! Service discovery registration
//!
//! The exporter can announce itself to a Consul agent at startup and withdraw
//! the announcement on shutdown. Registration failure is fatal; deregistration
//! is best effort and bounded by a timeout.
//!
//! ```text
//! Unregistered ──register──► Registered ──shutdown──► Deregistering ──► Terminated
//! ```

use crate::config::ConsulConfig;
use crate::error::{ExporterError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;
/// Default connection timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
/// Upper bound on deregistration during shutdown
pub const DEFAULT_DEREGISTER_TIMEOUT: Duration = Duration::from_secs(5);

const TOKEN_HEADER: &str = "X-Consul-Token";

/// A discovery backend
#[async_trait]
pub trait Registrator: Send + Sync {
    /// Backend name, for logging
    fn name(&self) -> &'static str;

    /// Announce the service
    async fn register(&self) -> Result<()>;

    /// Withdraw the announcement
    async fn deregister(&self) -> Result<()>;
}

/// Service definition accepted by the agent API
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    port: u16,
    tags: Vec<String>,
}

/// Registers the exporter with a Consul agent
pub struct ConsulRegistrator {
    client: Client,
    base_url: String,
    datacenter: Option<String>,
    token: Option<String>,
    service: ServiceRegistration,
}

impl ConsulRegistrator {
    /// Create a registrator advertising `port` as the scrape port
    ///
    /// # Errors
    /// Returns `ExporterError::Discovery` if the HTTP client cannot be created
    pub fn new(cfg: &ConsulConfig, port: u16) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ExporterError::Discovery(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: format!("{}://{}", cfg.scheme, cfg.address),
            datacenter: cfg.datacenter.clone(),
            token: cfg.token.clone(),
            service: ServiceRegistration {
                id: cfg.service.id.clone(),
                name: cfg.service.name.clone(),
                address: cfg.service.address.clone(),
                port,
                tags: cfg.service.tags.clone(),
            },
        })
    }

    pub fn service_id(&self) -> &str {
        &self.service.id
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.put(format!("{}{}", self.base_url, path));
        if let Some(dc) = &self.datacenter {
            request = request.query(&[("dc", dc)]);
        }
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        request
    }

    async fn send(&self, request: reqwest::RequestBuilder, action: &str) -> Result<()> {
        let response = request.send().await.map_err(|e| {
            error!(agent = %self.base_url, error = %e, "Consul connection failed");
            ExporterError::Discovery(format!("failed to {action} with {}: {e}", self.base_url))
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(agent = %self.base_url, service = %self.service.id, %status, "Consul {action} ok");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            error!(agent = %self.base_url, %status, body = %body, "Consul request failed");
            Err(ExporterError::Discovery(format!(
                "consul {action} returned {status}: {body}"
            )))
        }
    }
}

#[async_trait]
impl Registrator for ConsulRegistrator {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn register(&self) -> Result<()> {
        let request = self.request("/v1/agent/service/register").json(&self.service);
        self.send(request, "register").await
    }

    async fn deregister(&self) -> Result<()> {
        let path = format!("/v1/agent/service/deregister/{}", self.service.id);
        self.send(self.request(&path), "deregister").await
    }
}

/// Where the lifecycle stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Unregistered,
    Registered,
    Deregistering,
    Terminated,
}

/// Drives a [`Registrator`] through startup and shutdown
pub struct DiscoveryLifecycle {
    registrator: Arc<dyn Registrator>,
    state: DiscoveryState,
    deregister_timeout: Duration,
}

impl DiscoveryLifecycle {
    pub fn new(registrator: Arc<dyn Registrator>) -> Self {
        Self {
            registrator,
            state: DiscoveryState::Unregistered,
            deregister_timeout: DEFAULT_DEREGISTER_TIMEOUT,
        }
    }

    pub fn deregister_timeout(mut self, timeout: Duration) -> Self {
        self.deregister_timeout = timeout;
        self
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Register once at startup
    ///
    /// # Errors
    /// Registration errors are returned unchanged; the caller treats them as
    /// fatal. Calling this in any state but `Unregistered` is a no-op.
    pub async fn register(&mut self) -> Result<()> {
        if self.state != DiscoveryState::Unregistered {
            return Ok(());
        }
        info!(backend = self.registrator.name(), "Registering service");
        self.registrator.register().await?;
        self.state = DiscoveryState::Registered;
        Ok(())
    }

    /// Deregister and terminate
    ///
    /// Never fails: errors and timeouts are logged.
    pub async fn shutdown(&mut self) {
        if self.state != DiscoveryState::Registered {
            self.state = DiscoveryState::Terminated;
            return;
        }

        self.state = DiscoveryState::Deregistering;
        info!(backend = self.registrator.name(), "Deregistering service");

        match tokio::time::timeout(self.deregister_timeout, self.registrator.deregister()).await {
            Ok(Ok(())) => debug!(backend = self.registrator.name(), "Service deregistered"),
            Ok(Err(e)) => warn!(error = %e, "Deregistration failed"),
            Err(_) => warn!(
                timeout_ms = self.deregister_timeout.as_millis() as u64,
                "Deregistration timed out"
            ),
        }

        self.state = DiscoveryState::Terminated;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ConsulServiceConfig;
    use axum::{
        Router,
        extract::{Path, Query, State},
        http::{HeaderMap, StatusCode},
        routing::put,
    };
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MockRegistrator {
        registers: AtomicUsize,
        deregisters: AtomicUsize,
        fail_register: bool,
        fail_deregister: bool,
        hang_deregister: bool,
    }

    #[async_trait]
    impl Registrator for MockRegistrator {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn register(&self) -> Result<()> {
            self.registers.fetch_add(1, Ordering::SeqCst);
            if self.fail_register {
                return Err(ExporterError::Discovery("agent unreachable".into()));
            }
            Ok(())
        }

        async fn deregister(&self) -> Result<()> {
            self.deregisters.fetch_add(1, Ordering::SeqCst);
            if self.hang_deregister {
                std::future::pending::<()>().await;
            }
            if self.fail_deregister {
                return Err(ExporterError::Discovery("agent unreachable".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let mock = Arc::new(MockRegistrator::default());
        let mut lifecycle = DiscoveryLifecycle::new(Arc::clone(&mock) as Arc<dyn Registrator>);
        assert_eq!(lifecycle.state(), DiscoveryState::Unregistered);

        lifecycle.register().await.unwrap();
        assert_eq!(lifecycle.state(), DiscoveryState::Registered);

        // Second call does not register again
        lifecycle.register().await.unwrap();
        assert_eq!(mock.registers.load(Ordering::SeqCst), 1);

        lifecycle.shutdown().await;
        assert_eq!(lifecycle.state(), DiscoveryState::Terminated);
        assert_eq!(mock.deregisters.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_failure_is_returned() {
        let mock = Arc::new(MockRegistrator {
            fail_register: true,
            ..Default::default()
        });
        let mut lifecycle = DiscoveryLifecycle::new(Arc::clone(&mock) as Arc<dyn Registrator>);

        assert!(matches!(
            lifecycle.register().await,
            Err(ExporterError::Discovery(_))
        ));
        assert_eq!(lifecycle.state(), DiscoveryState::Unregistered);

        // Nothing to withdraw
        lifecycle.shutdown().await;
        assert_eq!(mock.deregisters.load(Ordering::SeqCst), 0);
        assert_eq!(lifecycle.state(), DiscoveryState::Terminated);
    }

    #[tokio::test]
    async fn test_deregister_failure_still_terminates() {
        let mock = Arc::new(MockRegistrator {
            fail_deregister: true,
            ..Default::default()
        });
        let mut lifecycle = DiscoveryLifecycle::new(mock);
        lifecycle.register().await.unwrap();
        lifecycle.shutdown().await;
        assert_eq!(lifecycle.state(), DiscoveryState::Terminated);
    }

    #[tokio::test]
    async fn test_hanging_deregister_is_bounded() {
        let mock = Arc::new(MockRegistrator {
            hang_deregister: true,
            ..Default::default()
        });
        let mut lifecycle =
            DiscoveryLifecycle::new(mock).deregister_timeout(Duration::from_millis(50));
        lifecycle.register().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), lifecycle.shutdown())
            .await
            .unwrap();
        assert_eq!(lifecycle.state(), DiscoveryState::Terminated);
    }

    /// What the mock agent saw
    #[derive(Default)]
    struct AgentState {
        registered: Mutex<Vec<serde_json::Value>>,
        deregistered: Mutex<Vec<String>>,
        tokens: Mutex<Vec<String>>,
        datacenters: Mutex<Vec<String>>,
    }

    async fn start_mock_agent() -> (SocketAddr, Arc<AgentState>) {
        let state = Arc::new(AgentState::default());

        let app = Router::new()
            .route("/v1/agent/service/register", put(handle_register))
            .route("/v1/agent/service/deregister/:id", put(handle_deregister))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr, state)
    }

    async fn record_request(
        state: &AgentState,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
    ) {
        if let Some(token) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
            state.tokens.lock().await.push(token.to_string());
        }
        if let Some(dc) = query.get("dc") {
            state.datacenters.lock().await.push(dc.clone());
        }
    }

    async fn handle_register(
        State(state): State<Arc<AgentState>>,
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
        body: String,
    ) -> StatusCode {
        record_request(&state, &headers, &query).await;
        let Ok(value) = serde_json::from_str(&body) else {
            return StatusCode::BAD_REQUEST;
        };
        state.registered.lock().await.push(value);
        StatusCode::OK
    }

    async fn handle_deregister(
        State(state): State<Arc<AgentState>>,
        Path(id): Path<String>,
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> StatusCode {
        record_request(&state, &headers, &query).await;
        state.deregistered.lock().await.push(id);
        StatusCode::OK
    }

    fn consul_config(addr: SocketAddr) -> ConsulConfig {
        ConsulConfig {
            enable: true,
            address: addr.to_string(),
            scheme: "http".to_string(),
            datacenter: Some("dc1".to_string()),
            token: Some("secret".to_string()),
            service: ConsulServiceConfig {
                id: "exporter-1".to_string(),
                name: "nginx-exporter".to_string(),
                address: Some("10.0.0.5".to_string()),
                tags: vec!["nginx".to_string()],
            },
        }
    }

    #[tokio::test]
    async fn test_consul_register_and_deregister() {
        let (addr, agent) = start_mock_agent().await;
        let registrator = ConsulRegistrator::new(&consul_config(addr), 4040).unwrap();
        assert_eq!(registrator.name(), "consul");
        assert_eq!(registrator.service_id(), "exporter-1");

        registrator.register().await.unwrap();
        registrator.deregister().await.unwrap();

        let registered = agent.registered.lock().await;
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0]["ID"], "exporter-1");
        assert_eq!(registered[0]["Name"], "nginx-exporter");
        assert_eq!(registered[0]["Address"], "10.0.0.5");
        assert_eq!(registered[0]["Port"], 4040);
        assert_eq!(registered[0]["Tags"][0], "nginx");

        assert_eq!(*agent.deregistered.lock().await, vec!["exporter-1".to_string()]);
        assert_eq!(agent.tokens.lock().await.len(), 2);
        assert_eq!(*agent.datacenters.lock().await, vec!["dc1", "dc1"]);
    }

    #[tokio::test]
    async fn test_consul_address_omitted_when_unset() {
        let (addr, agent) = start_mock_agent().await;
        let mut cfg = consul_config(addr);
        cfg.service.address = None;
        cfg.token = None;
        cfg.datacenter = None;

        ConsulRegistrator::new(&cfg, 9000)
            .unwrap()
            .register()
            .await
            .unwrap();

        let registered = agent.registered.lock().await;
        assert!(registered[0].get("Address").is_none());
        assert!(agent.tokens.lock().await.is_empty());
        assert!(agent.datacenters.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_consul_unreachable_agent() {
        let cfg = ConsulConfig {
            address: "127.0.0.1:1".to_string(),
            ..ConsulConfig::default()
        };
        let registrator = ConsulRegistrator::new(&cfg, 4040).unwrap();
        assert!(matches!(
            registrator.register().await,
            Err(ExporterError::Discovery(_))
        ));
    }
}
