//! Demo listener for the MITM proxy core.
//!
//! Wires the default collaborators (an `RcgenCertFactory`-backed `CertConfig`,
//! a `NoopHandler`, a `HyperUpstreamDispatcher`, and a `NullInboundQueue` for
//! non-intercepted CONNECTs) to a plain TCP accept loop, one
//! `proxy::serve_connection` task per accepted connection — grounded in the
//! teacher's `proxy::server::create_reusable_socket`/accept-loop shape,
//! stripped of the `pingora` service runtime it previously ran under.

use clap::Parser;
use mitm_proxy_core::config::settings::ProxyConfig;
use mitm_proxy_core::dispatch::HyperUpstreamDispatcher;
use mitm_proxy_core::inbound::NullInboundQueue;
use mitm_proxy_core::tls::RcgenCertFactory;
use mitm_proxy_core::{init_logger_with_config, log_error, log_info, proxy, ProxyOptions};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "mitm-proxy-demo", about = "Intercepting HTTP/HTTPS proxy core demo listener")]
struct Args {
    /// Address the proxy listens on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Hostname that identifies requests addressed to the proxy itself.
    #[arg(long, default_value = "mitm-proxy.local")]
    api_host: String,

    /// Enable TLS interception (mints a root CA at the given paths if absent).
    #[arg(long, default_value_t = false)]
    enable_mitm: bool,

    #[arg(long, default_value = "ca-certs/rootCA.crt")]
    ca_cert_path: String,

    #[arg(long, default_value = "ca-certs/rootCA.key")]
    ca_key_path: String,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, default_value_t = false)]
    enable_file_logging: bool,
}

impl Args {
    /// Layer the CLI overrides the user actually passed on top of
    /// `ProxyConfig::default()` rather than hand-building the struct field by
    /// field — the ambient settings type stays the single source of truth for
    /// the listener's operational knobs (read timeout, keep-alive, TLS cache).
    fn into_proxy_config(self) -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.listen_addr = self.listen;
        config.log_level = self.log_level;
        config.tls.ca_cert_path = self.ca_cert_path;
        config.tls.ca_key_path = self.ca_key_path;
        config
    }
}

/// Bind a listening socket with `SO_REUSEADDR` (and, opt-in, `SO_REUSEPORT`
/// for multi-process demos) before handing it to tokio.
fn create_reusable_socket(addr: SocketAddr) -> anyhow::Result<Socket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;

    if std::env::var("PROXY_USE_REUSEPORT").unwrap_or_default() == "true" {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        socket.set_reuse_port(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let enable_mitm = args.enable_mitm;
    let enable_file_logging = args.enable_file_logging;
    let api_host = args.api_host.clone();
    let config = args.into_proxy_config();

    init_logger_with_config(&config.log_level, enable_file_logging);
    log_info!("starting mitm-proxy-demo on {}", config.listen_addr);

    let mut options = ProxyOptions::new(api_host.clone());

    if enable_mitm {
        let factory = RcgenCertFactory::load_or_generate(
            &config.tls.ca_cert_path,
            &config.tls.ca_key_path,
            &config.tls.cert_organization,
            config.tls.cert_validity_days,
            config.tls.cert_cache_ttl_secs,
        )?;
        options = options.with_cert_config(Arc::new(factory));
        log_info!("TLS interception ENABLED — CA download at http://{}/cert.crt", api_host);
    } else {
        log_info!("TLS interception DISABLED — CONNECTs will always pass through");
    }

    let options = Arc::new(options);
    let dispatcher: Arc<dyn mitm_proxy_core::UpstreamDispatcher> =
        Arc::new(HyperUpstreamDispatcher::default());
    // No external routing fabric wired up in the demo: passthrough CONNECTs and
    // non-intercepted HTTPS are simply dropped.
    let inbound: Arc<dyn mitm_proxy_core::InboundQueue> = Arc::new(NullInboundQueue);

    let std_listener: std::net::TcpListener = create_reusable_socket(config.listen_addr)?.into();
    let listener = TcpListener::from_std(std_listener)?;
    log_info!("listening on {}", config.listen_addr);

    let read_timeout = Duration::from_secs(config.request_read_timeout_secs);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log_error!("accept error: {}", e);
                continue;
            }
        };

        let options = options.clone();
        let dispatcher = dispatcher.clone();
        let inbound = inbound.clone();

        tokio::spawn(async move {
            proxy::serve_connection(stream, peer_addr, read_timeout, options, dispatcher, inbound)
                .await;
        });
    }
}
