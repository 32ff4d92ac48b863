//! Configuration types.
//!
//! `ProxyOptions` is the core's "Option" — the collaborators the session loop is
//! built around (certificate factory, API host, handler). It is constructed
//! programmatically by the embedding application, never parsed from a file.
//!
//! `ProxyConfig` is the ambient, `serde`-derived settings struct the demo binary
//! loads to drive the listener — independent of `ProxyOptions`, in the same spirit
//! as the teacher's own split between `ProxyConfig`/`TlsConfig`.

use crate::auth::AuthCache;
use crate::handler::ProxyHandler;
use crate::tls::cert_gen::CertFactory;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

/// The collaborators the session loop dispatches to. Cheaply cloned: every field
/// is either owned data or an `Arc`.
#[derive(Clone)]
pub struct ProxyOptions {
    /// Presence enables TLS interception; absence forces all CONNECTs to passthrough.
    pub cert_config: Option<Arc<dyn CertFactory>>,
    /// Hostname that identifies requests addressed to the proxy itself.
    pub api_host: String,
    /// Optional request/response/api/error hooks.
    pub handler: Option<Arc<dyn ProxyHandler>>,
    /// Optional credential cache; absence means anonymous mode (no auth gate).
    pub auth_cache: Option<Arc<dyn AuthCache>>,
}

impl ProxyOptions {
    pub fn new(api_host: impl Into<String>) -> Self {
        Self {
            cert_config: None,
            api_host: api_host.into(),
            handler: None,
            auth_cache: None,
        }
    }

    pub fn with_cert_config(mut self, factory: Arc<dyn CertFactory>) -> Self {
        self.cert_config = Some(factory);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn ProxyHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_auth_cache(mut self, cache: Arc<dyn AuthCache>) -> Self {
        self.auth_cache = Some(cache);
        self
    }

    pub fn mitm_enabled(&self) -> bool {
        self.cert_config.is_some()
    }
}

/// Ambient operational settings for the demo listener — distinct from `ProxyOptions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Deadline reset before each request read (§4.1: 30s).
    pub request_read_timeout_secs: u64,
    /// Advertised `Keep-Alive: timeout=` value (§4.1/§4.6: 25s).
    pub keep_alive_timeout_secs: u64,
    pub tls: TlsConfig,
}

/// Certificate-factory knobs for the default `RcgenCertFactory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_organization: String,
    pub cert_common_name: String,
    pub cert_validity_days: u32,
    pub ca_cert_path: String,
    pub ca_key_path: String,
    /// In-memory leaf cert cache TTL in seconds.
    pub cert_cache_ttl_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().unwrap(),
            log_level: "info".to_string(),
            request_read_timeout_secs: 30,
            keep_alive_timeout_secs: 25,
            tls: TlsConfig::default(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_organization: "MITM Proxy Core".to_string(),
            cert_common_name: "mitm-proxy.local".to_string(),
            cert_validity_days: 365,
            ca_cert_path: "ca-certs/rootCA.crt".to_string(),
            ca_key_path: "ca-certs/rootCA.key".to_string(),
            cert_cache_ttl_secs: 24 * 60 * 60,
        }
    }
}
