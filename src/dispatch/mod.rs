//! Upstream request dispatch (§4.1 "Upstream dispatch", §5, §9).
//!
//! Grounded in the teacher's `proxy::http_client::HttpClient` (a shared,
//! connection-pooled `hyper::Client`), generalized from one client per process to
//! a cache keyed `(source address, User-Agent)` as the spec requires, and
//! trimmed of the HTTP/2-tuning and multi-process env-var branches that have no
//! counterpart in SPEC_FULL.md.

use crate::error::ProxyError;
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Response};
use hyper_rustls::HttpsConnectorBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Delivers a prepared upstream request and returns its response (§4.1).
#[async_trait]
pub trait UpstreamDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        source: SocketAddr,
        user_agent: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, ProxyError>;

    /// Release any per-`source` resources held by this dispatcher (§5: "the
    /// per-connection HTTP client is owned by its connection task and released
    /// on loop exit"). Default no-op for dispatchers with nothing to release.
    async fn release(&self, _source: SocketAddr) {}
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 50,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

type PooledClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

/// A `(source address, User-Agent)`-keyed cache of pooled `hyper` clients
/// (§9 "Upstream client keying").
pub struct HyperUpstreamDispatcher {
    config: DispatchConfig,
    clients: Mutex<HashMap<(SocketAddr, String), Arc<PooledClient>>>,
}

impl HyperUpstreamDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, source: SocketAddr, user_agent: &str) -> Arc<PooledClient> {
        let key = (source, user_agent.to_string());
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return client.clone();
        }

        debug!("opening new pooled client for {:?}", key);
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(self.config.connect_timeout));
        connector.set_nodelay(true);

        let https_connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);

        let client = Arc::new(
            Client::builder()
                .pool_idle_timeout(self.config.idle_timeout)
                .pool_max_idle_per_host(self.config.max_idle_per_host)
                .http2_only(false)
                .build(https_connector),
        );
        clients.insert(key, client.clone());
        client
    }
}

impl Default for HyperUpstreamDispatcher {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

#[async_trait]
impl UpstreamDispatcher for HyperUpstreamDispatcher {
    async fn dispatch(
        &self,
        source: SocketAddr,
        user_agent: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        let client = self.client_for(source, user_agent).await;
        let host = req
            .uri()
            .host()
            .map(str::to_string)
            .unwrap_or_else(|| "unknown".to_string());

        client.request(req).await.map_err(|e| {
            // §9(a): an untrusted/invalid upstream certificate is not blocked —
            // surfaced as a request-scoped error like any other dispatch failure.
            if e.to_string().to_lowercase().contains("certificate") {
                ProxyError::UnsupportedCert {
                    host,
                    reason: e.to_string(),
                }
            } else {
                ProxyError::Upstream(e.to_string())
            }
        })
    }

    /// Releases idle connections owned by `source`'s clients (§5: "released on
    /// loop exit").
    async fn release(&self, source: SocketAddr) {
        self.clients.lock().await.retain(|(addr, _), _| *addr != source);
    }
}
