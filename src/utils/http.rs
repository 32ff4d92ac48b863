//! HTTP helper functions shared by request preparation, response writing, and
//! the API handler.

use hyper::{Body, HeaderMap, Response, StatusCode};

/// Hop-by-hop headers per the GLOSSARY: scope is a single transport hop.
/// Both the singular (`Trailer`, RFC 7230) and the legacy plural (`Trailers`,
/// carried by some older clients/proxies) are stripped.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.to_lowercase().as_str())
}

/// Remove every hop-by-hop header from `headers` in place.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let to_remove: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in to_remove {
        headers.remove(name);
    }
}

/// Parse a CONNECT target (`host:port`). Unlike a lenient "default to 443"
/// parser, a missing or unparsable port is an error — MITM eligibility (§4.1,
/// §6) depends on the port being *explicitly* 443 or 8443, so a target with no
/// port must never silently qualify.
pub fn parse_connect_target(target: &str) -> Result<(String, u16), String> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| format!("CONNECT target missing port: {}", target))?;
    let port: u16 = port
        .parse()
        .map_err(|_| format!("CONNECT target has invalid port: {}", target))?;
    Ok((host.to_string(), port))
}

pub fn build_error_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Body::from(message.to_string()))
        .unwrap()
}
