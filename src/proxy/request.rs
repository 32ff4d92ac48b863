//! Request classification, source-address pinning, and upstream preparation
//! (§4.1 "Request classification (Dispatch)", "Source-address pinning",
//! "Upstream request preparation").

use crate::error::{ProxyError, ProxyResult};
use crate::models::ConnState;
use crate::utils::strip_hop_by_hop_headers;
use hyper::header::{HeaderValue, ACCEPT_ENCODING, HOST};
use hyper::http::uri::PathAndQuery;
use hyper::{Body, Method, Request, Uri};
use std::net::SocketAddr;

/// The header a trusted upstream component (e.g. an L4 load balancer) can set
/// on the first request of a connection to override the observed source
/// address (§4.1 "Source-address pinning", §6 "Control header"). Always
/// stripped before forwarding, whether or not it was used.
pub const SOURCE_ADDRESS_HEADER: &str = "origin-request-source-address";

/// Where a trusted, classified request is routed (§4.1 "Dispatch").
pub enum Classification {
    Connect,
    ApiRequest,
    ForwardHttp,
}

/// Hostname a request targets, port stripped — from the URI authority for
/// absolute-form (proxy-form) requests, falling back to the `Host` header for
/// origin-form requests (post-CONNECT, post-TLS-intercept).
pub fn request_host(req: &Request<Body>) -> Option<String> {
    req.uri()
        .host()
        .map(|h| h.to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(strip_port)
        })
}

fn strip_port(host_header: &str) -> String {
    // IPv6 literals carry their own brackets and must not be split on ':'.
    if host_header.starts_with('[') {
        if let Some(end) = host_header.find(']') {
            return host_header[..=end].to_string();
        }
    }
    host_header
        .rsplit_once(':')
        .map(|(host, _port)| host.to_string())
        .unwrap_or_else(|| host_header.to_string())
}

/// Classify a trusted request (§4.1 "Request classification").
pub fn classify(req: &Request<Body>, api_host: &str) -> Classification {
    if req.method() == Method::CONNECT {
        return Classification::Connect;
    }
    match request_host(req) {
        Some(host) if host.eq_ignore_ascii_case(api_host) => Classification::ApiRequest,
        _ => Classification::ForwardHttp,
    }
}

/// Resolve and cache this connection's pinned source address (§4.1
/// "Source-address pinning", §8 invariant 6/7). Always strips
/// `Origin-Request-Source-Address` from the request, whether or not it ends up
/// being used — it must never reach the upstream dispatcher.
pub async fn resolve_source(state: &ConnState, req: &mut Request<Body>) -> SocketAddr {
    let header_value = req
        .headers_mut()
        .remove(SOURCE_ADDRESS_HEADER)
        .and_then(|v| v.to_str().ok().map(str::to_string));

    state
        .source_addr(|| {
            header_value
                .as_deref()
                .and_then(|raw| raw.parse::<SocketAddr>().ok())
                .unwrap_or(state.peer_addr)
        })
        .await
}

/// Upstream request preparation (§4.1 "Upstream request preparation
/// (ForwardHTTP)", steps 1-5). Fails with `ProxyError::InvalidUrl` if, after
/// preparation, the request has no resolvable scheme or host (§8 invariant 5).
pub fn prepare_upstream_request(mut req: Request<Body>, is_tls: bool) -> ProxyResult<Request<Body>> {
    let host_header = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Step 1: canonical host is the Host header if present, else the URI's own host.
    let canonical_host = host_header
        .clone()
        .or_else(|| req.uri().host().map(str::to_string))
        .ok_or_else(|| ProxyError::InvalidUrl("request carries no Host header and no URI host".into()))?;

    let authority: hyper::http::uri::Authority = match req.uri().authority() {
        Some(existing) => existing.clone(),
        None => canonical_host
            .parse()
            .map_err(|_| ProxyError::InvalidUrl(format!("invalid host: {canonical_host}")))?,
    };

    // Step 2: scheme follows whether the current client stream is TLS-terminated.
    let scheme = if is_tls { "https" } else { "http" };

    let path_and_query = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    // Step 4: the rebuilt URI carries only scheme + authority + path/query —
    // hyper's own HTTP/1 client writer serializes the request line in
    // origin-form from path_and_query regardless, so this is "clearing the
    // request-URI" for wire purposes while still giving the client enough to
    // dial the right authority.
    let new_uri = Uri::builder()
        .scheme(scheme)
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;
    *req.uri_mut() = new_uri;

    // Step 5 (Host half): strip a spurious "host:443"/"host:80" duplicate of
    // the URI's own (now-canonical) authority; anything else is preserved.
    let host_value = strip_default_port(authority.as_str(), scheme);
    req.headers_mut().insert(
        HOST,
        HeaderValue::from_str(&host_value).map_err(|_| ProxyError::InvalidUrl(host_value.clone()))?,
    );

    // Step 3: the proxy only ever forwards a content-coding it can decode for
    // handler inspection.
    if req.headers().contains_key(ACCEPT_ENCODING) {
        req.headers_mut()
            .insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    }

    // Step 5 (hop-by-hop half).
    strip_hop_by_hop_headers(req.headers_mut());

    Ok(req)
}

fn strip_default_port(authority: &str, scheme: &str) -> String {
    let default_port = if scheme == "https" { ":443" } else { ":80" };
    authority
        .strip_suffix(default_port)
        .map(str::to_string)
        .unwrap_or_else(|| authority.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnState;

    fn req(method: Method, uri: &str, host: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(h) = host {
            builder = builder.header(HOST, h);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn classifies_connect() {
        let r = req(Method::CONNECT, "example.test:443", None);
        assert!(matches!(classify(&r, "proxy.local"), Classification::Connect));
    }

    #[test]
    fn classifies_api_host_case_insensitively() {
        let r = req(Method::GET, "http://Proxy.Local/cert.crt", Some("Proxy.Local"));
        assert!(matches!(classify(&r, "proxy.local"), Classification::ApiRequest));
    }

    #[test]
    fn classifies_everything_else_as_forward() {
        let r = req(Method::GET, "http://example.test/", Some("example.test"));
        assert!(matches!(classify(&r, "proxy.local"), Classification::ForwardHttp));
    }

    #[tokio::test]
    async fn source_header_is_parsed_and_always_stripped() {
        let state = ConnState::new("10.0.0.9:4000".parse().unwrap());
        let mut r = req(Method::GET, "http://example.test/", Some("example.test"));
        r.headers_mut()
            .insert(SOURCE_ADDRESS_HEADER, HeaderValue::from_static("203.0.113.5:9001"));

        let source = resolve_source(&state, &mut r).await;
        assert_eq!(source, "203.0.113.5:9001".parse::<SocketAddr>().unwrap());
        assert!(!r.headers().contains_key(SOURCE_ADDRESS_HEADER));
    }

    #[tokio::test]
    async fn falls_back_to_peer_addr_when_header_absent() {
        let state = ConnState::new("10.0.0.9:4000".parse().unwrap());
        let mut r = req(Method::GET, "http://example.test/", Some("example.test"));
        let source = resolve_source(&state, &mut r).await;
        assert_eq!(source, "10.0.0.9:4000".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn source_is_pinned_across_subsequent_requests() {
        let state = ConnState::new("10.0.0.9:4000".parse().unwrap());
        let mut first = req(Method::GET, "http://example.test/", Some("example.test"));
        first
            .headers_mut()
            .insert(SOURCE_ADDRESS_HEADER, HeaderValue::from_static("203.0.113.5:9001"));
        let first_source = resolve_source(&state, &mut first).await;

        let mut second = req(Method::GET, "http://other.test/", Some("other.test"));
        let second_source = resolve_source(&state, &mut second).await;
        assert_eq!(first_source, second_source);
    }

    #[test]
    fn prepares_origin_form_request_using_host_header() {
        let r = req(Method::GET, "/path?x=1", Some("example.test"));
        let prepared = prepare_upstream_request(r, false).unwrap();
        assert_eq!(prepared.uri().scheme_str(), Some("http"));
        assert_eq!(prepared.uri().host(), Some("example.test"));
        assert_eq!(prepared.uri().path_and_query().unwrap(), "/path?x=1");
    }

    #[test]
    fn prepares_tls_request_with_https_scheme() {
        let r = req(Method::GET, "/", Some("example.test"));
        let prepared = prepare_upstream_request(r, true).unwrap();
        assert_eq!(prepared.uri().scheme_str(), Some("https"));
    }

    #[test]
    fn rewrites_accept_encoding_to_gzip_only() {
        let mut r = req(Method::GET, "/", Some("example.test"));
        r.headers_mut().insert(ACCEPT_ENCODING, HeaderValue::from_static("br, gzip"));
        let prepared = prepare_upstream_request(r, false).unwrap();
        assert_eq!(prepared.headers().get(ACCEPT_ENCODING).unwrap(), "gzip");
    }

    #[test]
    fn strips_hop_by_hop_headers_from_prepared_request() {
        let mut r = req(Method::GET, "/", Some("example.test"));
        r.headers_mut().insert("connection", HeaderValue::from_static("keep-alive"));
        let prepared = prepare_upstream_request(r, false).unwrap();
        assert!(!prepared.headers().contains_key("connection"));
    }

    #[test]
    fn missing_host_is_invalid() {
        let r = Request::builder()
            .method(Method::GET)
            .uri("/path")
            .body(Body::empty())
            .unwrap();
        assert!(prepare_upstream_request(r, false).is_err());
    }
}
