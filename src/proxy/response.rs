//! Response writer (§4.6): hop-by-hop stripping plus keep-alive header
//! injection. Writing the response to the wire itself is hyper's job once the
//! `Service` future resolves with this `Response<Body>`.

use crate::utils::strip_hop_by_hop_headers;
use hyper::header::{HeaderValue, CONNECTION};
use hyper::{Body, HeaderMap, Response, StatusCode};

const KEEP_ALIVE_HEADER: &str = "keep-alive";

/// Strip hop-by-hop headers and, if `keep_alive`, advertise
/// `Connection: keep-alive` / `Keep-Alive: timeout=25` (§4.1, §4.6, §8
/// invariant 8). Never touches `response.Close`-equivalent state — hyper
/// decides on-the-wire connection handling from this header alone.
pub fn apply_keep_alive(resp: &mut Response<Body>, keep_alive: bool) {
    strip_hop_by_hop_headers(resp.headers_mut());
    if keep_alive {
        resp.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        resp.headers_mut()
            .insert(KEEP_ALIVE_HEADER, HeaderValue::from_static("timeout=25"));
    }
}

/// Mark a response `Connection: close` (§4.3 API responses, §4.1
/// handler-short-circuit responses use `keep_alive=false` instead).
pub fn apply_connection_close(resp: &mut Response<Body>) {
    strip_hop_by_hop_headers(resp.headers_mut());
    resp.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
}

pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    crate::utils::build_error_response(status, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_sets_both_headers() {
        let mut resp = Response::builder().status(200).body(Body::empty()).unwrap();
        apply_keep_alive(&mut resp, true);
        assert_eq!(resp.headers().get(CONNECTION).unwrap(), "keep-alive");
        assert_eq!(resp.headers().get(KEEP_ALIVE_HEADER).unwrap(), "timeout=25");
    }

    #[test]
    fn no_keep_alive_sets_neither_header() {
        let mut resp = Response::builder().status(200).body(Body::empty()).unwrap();
        apply_keep_alive(&mut resp, false);
        assert!(resp.headers().get(CONNECTION).is_none());
        assert!(resp.headers().get(KEEP_ALIVE_HEADER).is_none());
    }

    #[test]
    fn keep_alive_strips_preexisting_hop_by_hop_headers() {
        let mut resp = Response::builder()
            .status(200)
            .header("transfer-encoding", "chunked")
            .body(Body::empty())
            .unwrap();
        apply_keep_alive(&mut resp, true);
        assert!(!resp.headers().contains_key("transfer-encoding"));
    }

    #[test]
    fn connection_close_overrides_keep_alive_headers() {
        let mut resp = Response::builder().status(404).body(Body::empty()).unwrap();
        apply_connection_close(&mut resp);
        assert_eq!(resp.headers().get(CONNECTION).unwrap(), "close");
    }
}
