//! The connection state loop (§4.1) — the core of this crate.
//!
//! Grounded in the teacher's `proxy::server` (`handle_request` →
//! `handle_connect_request` → `handle_https_interception` → a second
//! `hyper::server::conn::Http::new().serve_connection(...)` on the decrypted
//! stream): rather than a hand-rolled byte-level HTTP parser, each accepted TCP
//! connection gets a fresh `hyper::service::Service` (`SessionCtx`, reused
//! as-is across a successful TLS intercept via `Arc`-shared `ConnState`).
//! `AwaitRequest`/keep-alive is hyper's own per-connection request loop; the
//! "outer restart" of §9 is the second `serve_connection` call made from
//! inside the CONNECT handler once a TLS server handshake succeeds.
//!
//! CONNECT itself is recognized before any bytes reach hyper (`buffered_conn`
//! peeks the request line for a `CONNECT ` prefix): hyper's `Service` path has
//! no way to give the client-facing `200` line a custom reason phrase, it
//! always serializes `StatusCode::canonical_reason()`, so the `200 Connection
//! established` wire contract (§6, §8 S2/S3) is written by hand directly onto
//! the accepted stream — grounded in the teacher's sibling-pack raw-socket
//! proxies (e.g. `numbata-metaproxy`'s `handle_connection`), which sniff
//! `CONNECT` off the first read the same way.

use crate::auth::{self, AuthOutcome};
use crate::config::settings::ProxyOptions;
use crate::dispatch::UpstreamDispatcher;
use crate::error::{guard_handler_call, ProxyError};
use crate::inbound::{InboundConnection, InboundQueue};
use crate::models::{ConnState, HandlerOutcome, SessionContext};
use crate::proxy::{api, buffered_conn, request, response};
use crate::tls::cert_gen::CertFactory;
use crate::utils::parse_connect_target;
use hyper::header::{PROXY_AUTHORIZATION, USER_AGENT};
use hyper::server::conn::Http;
use hyper::service::Service;
use hyper::{Body, Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_io_timeout::TimeoutStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

type PeekedConn = buffered_conn::BufferedConn<TimeoutStream<TcpStream>>;

/// Accept a client TCP connection and run the session loop on it to
/// completion (§4.1, §5 "one logical task owns the state loop"). Returns once
/// the connection — and any TLS-intercepted stream nested inside it — has
/// closed.
pub async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    read_timeout: Duration,
    opts: Arc<ProxyOptions>,
    dispatcher: Arc<dyn UpstreamDispatcher>,
    inbound: Arc<dyn InboundQueue>,
) {
    let mut timeout_stream = TimeoutStream::new(stream);
    timeout_stream.set_read_timeout(Some(read_timeout));
    let mut buffered = buffered_conn::wrap(timeout_stream);

    let ctx = SessionCtx {
        state: Arc::new(ConnState::new(peer_addr)),
        opts,
        dispatcher: dispatcher.clone(),
        inbound,
        read_timeout,
    };

    match buffered_conn::starts_with(&mut buffered, b"CONNECT ").await {
        Ok(true) => ctx.handle_connect(buffered).await,
        Ok(false) => {
            if let Err(e) = Http::new()
                .http1_only(true)
                .serve_connection(buffered, ctx.clone())
                .with_upgrades()
                .await
            {
                debug!("connection from {} ended: {}", peer_addr, e);
            }
        }
        Err(e) => debug!("connection from {} ended while classifying the first request: {}", peer_addr, e),
    }

    let source = ctx.state.source_addr(|| ctx.state.peer_addr).await;
    dispatcher.release(source).await;
}

/// The per-connection collaborators and state shared by every request hyper
/// parses on a connection, including the second, TLS-terminated parse loop
/// that follows a successful CONNECT intercept.
#[derive(Clone)]
struct SessionCtx {
    state: Arc<ConnState>,
    opts: Arc<ProxyOptions>,
    dispatcher: Arc<dyn UpstreamDispatcher>,
    inbound: Arc<dyn InboundQueue>,
    read_timeout: Duration,
}

impl Service<Request<Body>> for SessionCtx {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let ctx = self.clone();
        Box::pin(async move { ctx.handle(req).await })
    }
}

impl SessionCtx {
    /// `Dispatch` (§4.1): classify the trusted request and route it. CONNECT
    /// never reaches here — it is peeled off the raw stream in
    /// `serve_connection` before hyper starts parsing.
    async fn handle(&self, mut req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let source = request::resolve_source(&self.state, &mut req).await;

        if !self.state.is_trusted() {
            if let Some(cache) = &self.opts.auth_cache {
                let credential = req.headers().get(PROXY_AUTHORIZATION).and_then(|v| v.to_str().ok());
                match auth::check(cache.as_ref(), credential).await {
                    AuthOutcome::Accepted => self.state.set_trusted(),
                    AuthOutcome::Rejected => {
                        // §4.2: not an error, a ready-to-write 407; connection
                        // stays open and the trust latch stays false.
                        let mut resp = Response::builder()
                            .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
                            .header("Proxy-Authenticate", "Basic realm=\"proxy\"")
                            .body(Body::empty())
                            .unwrap();
                        response::apply_keep_alive(&mut resp, true);
                        return Ok(resp);
                    }
                }
            }
        }

        let ctx = SessionContext {
            source,
            is_tls: self.state.is_tls(),
            host: request::request_host(&req).unwrap_or_default(),
        };

        match request::classify(&req, &self.opts.api_host) {
            request::Classification::ApiRequest => Ok(api::handle(&ctx, &self.opts, req).await),
            request::Classification::ForwardHttp => Ok(self.forward(ctx, req).await),
            request::Classification::Connect => unreachable!("CONNECT is peeled off before hyper parses a request"),
        }
    }

    /// `ForwardHTTP` (§4.1): prepare, run the request handler hook, dispatch
    /// upstream, run the response handler hook, write.
    async fn forward(&self, ctx: SessionContext, req: Request<Body>) -> Response<Body> {
        let prepared = match request::prepare_upstream_request(req, ctx.is_tls) {
            Ok(r) => r,
            Err(e) => return self.error_response(&e).await,
        };

        let outcome = match &self.opts.handler {
            Some(handler) => match guard_handler_call(handler.handle_request(&ctx, prepared)).await {
                Ok(outcome) => outcome,
                Err(e) => return self.fatal_handler_error(&e).await,
            },
            None => HandlerOutcome::Unchanged(prepared),
        };

        let final_req = match outcome {
            HandlerOutcome::ShortCircuit(mut resp) => {
                // §4.1: written back immediately with keepAlive=false.
                response::apply_keep_alive(&mut resp, false);
                return resp;
            }
            HandlerOutcome::Unchanged(r) | HandlerOutcome::Replaced(r) => r,
        };

        let user_agent = final_req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let upstream_resp = match self.dispatcher.dispatch(ctx.source, &user_agent, final_req).await {
            Ok(resp) => resp,
            Err(e) => return self.error_response(&e).await,
        };

        let mut final_resp = match &self.opts.handler {
            Some(handler) => match guard_handler_call(handler.handle_response(&ctx, upstream_resp)).await {
                Ok(resp) => resp,
                Err(e) => return self.fatal_handler_error(&e).await,
            },
            None => upstream_resp,
        };
        response::apply_keep_alive(&mut final_resp, true);
        final_resp
    }

    /// §7: synthesize an error response and keep the connection open, after
    /// funneling the error through the handler.
    async fn error_response(&self, err: &ProxyError) -> Response<Body> {
        self.funnel_error(err).await;
        let mut resp = response::error_response(StatusCode::BAD_GATEWAY, &err.to_string());
        response::apply_keep_alive(&mut resp, true);
        resp
    }

    /// §7 `HandlerError`: funnel, then close the connection — unlike
    /// `error_response`, this does not advertise keep-alive.
    async fn fatal_handler_error(&self, err: &ProxyError) -> Response<Body> {
        self.funnel_error(err).await;
        let mut resp = response::error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
        response::apply_connection_close(&mut resp);
        resp
    }

    /// `Connect` (§4.1): parse the request line by hand, reply `200` with the
    /// literal `Connection established` reason phrase (§6), then peek and
    /// branch. `buffered` already owns the raw stream, so there is no upgrade
    /// handoff to wait on — everything from here runs inline in the
    /// connection's own task.
    async fn handle_connect(&self, mut buffered: PeekedConn) {
        let (target, version) = match read_connect_request(&mut buffered).await {
            Ok(v) => v,
            Err(e) => {
                self.funnel_error(&ProxyError::ClientRead(e.to_string())).await;
                return;
            }
        };

        let (host, port) = match parse_connect_target(&target) {
            Ok(v) => v,
            Err(e) => {
                let _ = buffered
                    .write_all(format!("HTTP/{version} 400 Bad Request\r\n\r\n").as_bytes())
                    .await;
                self.funnel_error(&ProxyError::InvalidUrl(e)).await;
                return;
            }
        };

        // §4.1 "MITM eligibility": CertConfig present AND explicit port 443/8443.
        // Any other port, or no CertConfig, falls straight through to
        // PassthroughTunnel without ever reading past the 200 reply — this is
        // the main transition table's direct `Connect -> PassthroughTunnel`
        // edge, not the vestigial non-443/8443 fallthrough §9(b) flags as a
        // bug in the original source; we do not reproduce that fallthrough.
        let mitm_eligible = self.opts.mitm_enabled() && matches!(port, 443 | 8443);

        // §4.1 "CONNECT tunnel reply": mirrors the client's HTTP major/minor
        // and carries the literal reason phrase, not hyper's canonical "OK".
        let reply = format!("HTTP/{version} 200 Connection established\r\n\r\n");
        if let Err(e) = buffered.write_all(reply.as_bytes()).await {
            self.funnel_error(&ProxyError::ClientWrite(e.to_string())).await;
            return;
        }

        if mitm_eligible {
            match buffered_conn::peek_byte(&mut buffered).await {
                Ok(Some(0x16)) => self.tls_intercept(buffered, host, port).await,
                Ok(_) => self.passthrough(buffered, host, port).await,
                Err(e) => self.funnel_error(&ProxyError::ClientRead(e.to_string())).await,
            }
        } else {
            self.passthrough(buffered, host, port).await;
        }
    }

    /// `TLSIntercept` (§4.1, §4.4): mint a per-host server config, handshake,
    /// and on success restart the outer loop on the decrypted stream.
    async fn tls_intercept(&self, buffered: PeekedConn, host: String, _port: u16) {
        let factory = match &self.opts.cert_config {
            Some(factory) => factory.clone(),
            None => return, // unreachable: mitm_eligible implies Some
        };

        let server_config = match factory.server_config_for_host(&host).await {
            Ok(config) => config,
            Err(e) => {
                self.funnel_error(&e).await;
                return;
            }
        };

        match TlsAcceptor::from(server_config).accept(buffered).await {
            Ok(tls_stream) => {
                self.state.mark_tls();
                if let Err(e) = Http::new()
                    .http1_only(true)
                    .serve_connection(tls_stream, self.clone())
                    .with_upgrades()
                    .await
                {
                    debug!("intercepted connection for {} ended: {}", host, e);
                }
            }
            Err(e) => {
                self.funnel_error(&ProxyError::TlsHandshake(e.to_string())).await;
            }
        }
    }

    /// `PassthroughTunnel` (§4.1): terminal — ownership of the stream passes
    /// to the inbound queue with its buffer intact (§8 invariant 3/4).
    async fn passthrough(&self, buffered: PeekedConn, host: String, port: u16) {
        let source = self.state.source_addr(|| self.state.peer_addr).await;
        self.inbound
            .enqueue(InboundConnection {
                source,
                target_host: host,
                target_port: port,
                stream: Box::new(buffered),
            })
            .await;
    }

    /// §4.7: route every error event through the handler, if one is present.
    async fn funnel_error(&self, err: &ProxyError) {
        if let Some(handler) = &self.opts.handler {
            let ctx = SessionContext {
                source: self.state.peer_addr,
                is_tls: self.state.is_tls(),
                host: String::new(),
            };
            handler.handle_error(&ctx, err).await;
        }
    }
}

/// Read a `CONNECT <target> HTTP/<version>` request line and drain headers up
/// to the blank line, without touching whatever follows (§4.5 — the peeked
/// buffer must still hold exactly the bytes after the request, e.g. a
/// pipelined TLS ClientHello). Returns the raw target authority and the
/// version string (e.g. `"1.1"`) to mirror back in the reply.
async fn read_connect_request(buffered: &mut PeekedConn) -> io::Result<(String, String)> {
    let mut request_line = String::new();
    buffered.read_line(&mut request_line).await?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default().to_string();
    let version = parts
        .next()
        .and_then(|v| v.strip_prefix("HTTP/"))
        .unwrap_or("1.1")
        .to_string();

    if method != "CONNECT" || target.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed CONNECT request line"));
    }

    // CONNECT carries no body; this core does not authenticate CONNECT itself
    // (§4.1 skips the trust gate for it), so the headers are only drained, not
    // inspected.
    loop {
        let mut header_line = String::new();
        let n = buffered.read_line(&mut header_line).await?;
        if n == 0 || header_line == "\r\n" || header_line == "\n" {
            break;
        }
    }

    Ok((target, version))
}
