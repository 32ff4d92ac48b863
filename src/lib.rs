//! An intercepting HTTP/HTTPS proxy core: plain HTTP forwarding, CONNECT
//! tunnels, and man-in-the-middle TLS interception behind a small
//! collaborator surface (certificate factory, auth cache, pluggable handler,
//! upstream dispatcher, inbound queue).

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod inbound;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod tls;
pub mod utils;

// Re-export commonly used items
pub use auth::{AuthCache, InMemoryAuthCache};
pub use config::settings::{ProxyConfig, ProxyOptions};
pub use dispatch::{HyperUpstreamDispatcher, UpstreamDispatcher};
pub use error::{ProxyError, ProxyResult};
pub use handler::{NoopHandler, ProxyHandler};
pub use inbound::{ChannelInboundQueue, InboundConnection, InboundQueue, NullInboundQueue};
pub use logging::{init_logger_with_config, log_debug, log_error, log_info, log_trace, log_warning};
pub use models::{ProxyLog, RequestData, ResponseData};
pub use proxy::serve_connection;
pub use tls::{CertFactory, RcgenCertFactory};
