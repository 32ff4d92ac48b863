//! The pluggable handler (§3, §9): four independently-optional capabilities.
//! Shape grounded in the teacher's `proxy::core::ProxyMiddleware` trait, but
//! generalized from "always-present middleware" to "each hook individually
//! optional", and given the power to replace or short-circuit (§4.1), not just
//! mutate in place.

use crate::error::ProxyError;
use crate::models::{HandlerOutcome, SessionContext};
use async_trait::async_trait;
use hyper::{Body, Request, Response};

/// Observes and optionally rewrites requests/responses passing through the
/// session loop. Every method has a default no-op implementation so a consumer
/// only implements the capabilities it needs.
#[async_trait]
pub trait ProxyHandler: Send + Sync {
    /// Called after request preparation (§4.1), before upstream dispatch.
    async fn handle_request(
        &self,
        _ctx: &SessionContext,
        req: Request<Body>,
    ) -> HandlerOutcome<Request<Body>, Response<Body>> {
        HandlerOutcome::Unchanged(req)
    }

    /// Called after upstream dispatch returns, before the response is written.
    async fn handle_response(&self, _ctx: &SessionContext, resp: Response<Body>) -> Response<Body> {
        resp
    }

    /// Called when the request targets `ApiHost` (§4.3). Returning `Some`
    /// takes over the response entirely; `None` falls through to the built-in
    /// CA-download/404 behavior.
    async fn handle_api_request(
        &self,
        _ctx: &SessionContext,
        _req: Request<Body>,
    ) -> Option<Response<Body>> {
        None
    }

    /// Called for every error event the session loop produces (§4.7), except
    /// `AuthRejected` which is not an error.
    async fn handle_error(&self, _ctx: &SessionContext, _err: &ProxyError) {}
}

/// A handler with every hook at its default (no observation, no rewriting).
pub struct NoopHandler;

#[async_trait]
impl ProxyHandler for NoopHandler {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn ctx() -> SessionContext {
        SessionContext {
            source: "127.0.0.1:9000".parse::<SocketAddr>().unwrap(),
            is_tls: false,
            host: "example.test".to_string(),
        }
    }

    #[tokio::test]
    async fn noop_handler_passes_request_through_unchanged() {
        let handler = NoopHandler;
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        match handler.handle_request(&ctx(), req).await {
            HandlerOutcome::Unchanged(_) => {}
            _ => panic!("expected Unchanged"),
        }
    }

    #[tokio::test]
    async fn noop_handler_does_not_claim_api_requests() {
        let handler = NoopHandler;
        let req = Request::builder().uri("/cert.crt").body(Body::empty()).unwrap();
        assert!(handler.handle_api_request(&ctx(), req).await.is_none());
    }
}
