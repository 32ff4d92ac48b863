//! API handler (§4.3): the proxy's own control endpoints. Reached once a
//! request is classified `ApiRequest` (its host equals `ProxyOptions::api_host`).

use crate::config::settings::ProxyOptions;
use crate::error::guard_handler_call;
use crate::models::SessionContext;
use crate::proxy::response::{apply_connection_close, error_response};
use hyper::{Body, Method, Request, Response, StatusCode};

const CERT_DOWNLOAD_PATH: &str = "/cert.crt";

const NOT_FOUND_TEMPLATE: &str = "<!DOCTYPE HTML PUBLIC \"-\n\
<html>\n  \
<head><title>Clash ManInTheMiddle Proxy Services - 404 Not Found</title></head>\n  \
<body><h1>Not Found</h1><p>The requested URL {path} was not found on this server.</p></body>\n\
</html>";

/// Serve `ApiHost` traffic (§4.3). API responses always close the connection
/// after writing, whether served by `Handler.HandleApiRequest`, the built-in
/// CA download, or the 404 fallback.
pub async fn handle(ctx: &SessionContext, opts: &ProxyOptions, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let mut resp = if let Some(handler) = &opts.handler {
        match guard_handler_call(handler.handle_api_request(ctx, req)).await {
            Ok(Some(resp)) => resp,
            Ok(None) => serve_builtin(opts, &method, &path),
            Err(e) => {
                // §7 `HandlerError`: funnel, then close — the request has
                // already been consumed by the panicking call, so the
                // built-in CA download/404 cannot run for it either.
                handler.handle_error(ctx, &e).await;
                error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    } else {
        serve_builtin(opts, &method, &path)
    };

    apply_connection_close(&mut resp);
    resp
}

/// The built-in CA-download/404 fallback behavior (§4.3, §6), reached when no
/// handler is present or `HandleApiRequest` declines to take over.
fn serve_builtin(opts: &ProxyOptions, method: &Method, path: &str) -> Response<Body> {
    if let Some(cert_config) = &opts.cert_config {
        if *method == Method::GET && path.to_lowercase() == CERT_DOWNLOAD_PATH {
            let pem = crate::tls::cert_gen::ca_to_pem(cert_config.root_ca_der());
            return Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/x-x509-ca-cert")
                .body(Body::from(pem))
                .unwrap();
        }
    }

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "text/html")
        .body(Body::from(NOT_FOUND_TEMPLATE.replace("{path}", path)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::cert_gen::CertFactory;
    use async_trait::async_trait;
    use hyper::body::to_bytes;
    use hyper::header::CONNECTION;
    use std::net::SocketAddr;
    use std::sync::Arc;

    struct FakeCertFactory;

    #[async_trait]
    impl CertFactory for FakeCertFactory {
        async fn server_config_for_host(&self, _host: &str) -> crate::error::ProxyResult<Arc<rustls::ServerConfig>> {
            unimplemented!("not exercised by API handler tests")
        }

        fn root_ca_der(&self) -> &[u8] {
            b"fake-der-bytes"
        }
    }

    fn ctx() -> SessionContext {
        SessionContext {
            source: "127.0.0.1:9000".parse::<SocketAddr>().unwrap(),
            is_tls: false,
            host: "proxy.local".to_string(),
        }
    }

    #[tokio::test]
    async fn serves_ca_download_as_pem() {
        let opts = ProxyOptions::new("proxy.local").with_cert_config(Arc::new(FakeCertFactory));
        let req = Request::builder()
            .method(Method::GET)
            .uri("http://proxy.local/cert.crt")
            .body(Body::empty())
            .unwrap();

        let resp = handle(&ctx(), &opts, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("Content-Type").unwrap(), "application/x-x509-ca-cert");
        assert_eq!(resp.headers().get(CONNECTION).unwrap(), "close");

        let body = to_bytes(resp.into_body()).await.unwrap();
        let pem = String::from_utf8(body.to_vec()).unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn cert_download_path_is_case_insensitive() {
        let opts = ProxyOptions::new("proxy.local").with_cert_config(Arc::new(FakeCertFactory));
        let req = Request::builder()
            .method(Method::GET)
            .uri("http://proxy.local/CERT.CRT")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&ctx(), &opts, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_path_returns_404_with_path_in_body() {
        let opts = ProxyOptions::new("proxy.local");
        let req = Request::builder()
            .method(Method::GET)
            .uri("http://proxy.local/nope")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&ctx(), &opts, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(resp.into_body()).await.unwrap();
        assert!(String::from_utf8(body.to_vec()).unwrap().contains("/nope"));
    }

    #[tokio::test]
    async fn no_cert_config_falls_through_to_404() {
        let opts = ProxyOptions::new("proxy.local");
        let req = Request::builder()
            .method(Method::GET)
            .uri("http://proxy.local/cert.crt")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&ctx(), &opts, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    struct PanickingHandler;

    #[async_trait]
    impl crate::handler::ProxyHandler for PanickingHandler {
        async fn handle_api_request(&self, _ctx: &SessionContext, _req: Request<Body>) -> Option<Response<Body>> {
            panic!("plugin exploded");
        }
    }

    #[tokio::test]
    async fn handler_panic_closes_connection_instead_of_serving_builtin() {
        let opts = ProxyOptions::new("proxy.local").with_handler(Arc::new(PanickingHandler));
        let req = Request::builder()
            .method(Method::GET)
            .uri("http://proxy.local/cert.crt")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&ctx(), &opts, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.headers().get(CONNECTION).unwrap(), "close");
    }
}
