use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

// Core data extracted from an HTTP request, used only for structured transaction
// logging (the ambient stack) — not the session state carried by the core loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestData {
    pub method: String,
    pub url: String,
    pub path: String,
    pub query_string: Option<String>,
    pub http_version: String,

    pub client_ip: IpAddr,
    pub client_port: u16,

    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,

    pub headers: HashMap<String, String>,
    pub content_type: Option<String>,
    pub content_length: u64,
    pub user_agent: Option<String>,
    pub host: Option<String>,

    pub is_https: bool,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseData {
    pub status_code: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub content_type: Option<String>,
    pub content_length: u64,
    pub response_time_ms: u64,
}

impl ResponseData {
    pub fn new(
        status_code: u16,
        status_text: String,
        content_type: Option<String>,
        content_length: u64,
        response_time_ms: u64,
    ) -> Self {
        Self {
            status_code,
            status_text,
            headers: HashMap::new(),
            content_type,
            content_length,
            response_time_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyLog {
    pub request: RequestData,
    pub response: Option<ResponseData>,
    pub error: Option<String>,
}

impl RequestData {
    pub fn new(method: String, url: String, client_ip: IpAddr, client_port: u16) -> Self {
        Self {
            method,
            url: url.clone(),
            path: Self::extract_path(&url),
            query_string: Self::extract_query(&url),
            http_version: "HTTP/1.1".to_string(),
            client_ip,
            client_port,
            timestamp: Utc::now(),
            duration_ms: None,
            headers: HashMap::new(),
            content_type: None,
            content_length: 0,
            user_agent: None,
            host: None,
            is_https: url.starts_with("https://"),
            protocol: "HTTP/1.1".to_string(),
        }
    }

    fn extract_path(url: &str) -> String {
        url::Url::parse(url)
            .map(|parsed| parsed.path().to_string())
            .unwrap_or_else(|_| "/".to_string())
    }

    fn extract_query(url: &str) -> Option<String> {
        url::Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.query().map(|q| q.to_string()))
    }
}

/// Per-connection state shared across every request the session loop parses on a
/// single client TCP connection, including the second, TLS-terminated, parse loop
/// that follows a successful CONNECT intercept (see `proxy::session`).
///
/// This is the spec's "trust latch" plus the cached, once-resolved source address
/// (§3, §4.1): both must survive exactly as long as the underlying connection, not
/// per request.
pub struct ConnState {
    /// Raw TCP peer address observed at accept time.
    pub peer_addr: SocketAddr,
    /// Whether the client has already presented acceptable credentials on this
    /// connection (§4.1, §4.2, §8 invariant 2).
    trusted: AtomicBool,
    /// Resolved once per connection, from `Origin-Request-Source-Address` or the
    /// raw peer address (§4.1, §8 invariant 6).
    source: Mutex<Option<SocketAddr>>,
    /// Set once the client stream has been TLS-terminated by an intercept.
    pub is_tls: AtomicBool,
}

impl ConnState {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            trusted: AtomicBool::new(false),
            source: Mutex::new(None),
            is_tls: AtomicBool::new(false),
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::Acquire)
    }

    pub fn set_trusted(&self) {
        self.trusted.store(true, Ordering::Release);
    }

    pub fn is_tls(&self) -> bool {
        self.is_tls.load(Ordering::Acquire)
    }

    pub fn mark_tls(&self) {
        self.is_tls.store(true, Ordering::Release);
    }

    /// Returns the connection's pinned source address, resolving and caching it
    /// from `resolve` on first call (§4.1 source-address pinning).
    pub async fn source_addr(&self, resolve: impl FnOnce() -> SocketAddr) -> SocketAddr {
        let mut guard = self.source.lock().await;
        if let Some(addr) = *guard {
            return addr;
        }
        let addr = resolve();
        *guard = Some(addr);
        addr
    }
}

/// Read-only view of the connection state handed to handler hooks (§3's `Session`,
/// narrowed to what a handler is allowed to observe: the core's `request`/`response`
/// fields stay as plain `hyper` types passed alongside, not on this struct, to keep
/// handler signatures simple — see `handler::ProxyHandler`).
#[derive(Clone, Debug)]
pub struct SessionContext {
    pub source: SocketAddr,
    pub is_tls: bool,
    pub host: String,
}

/// Outcome of a handler hook that may rewrite or short-circuit a request (§4.1,
/// §9 "Pluggable handler").
pub enum HandlerOutcome<Req, Resp> {
    /// Proceed unchanged.
    Unchanged(Req),
    /// Substitute this value for whatever would have happened next.
    Replaced(Req),
    /// Write this response back to the client immediately; `keep_alive=false`.
    ShortCircuit(Resp),
}
