//! Error taxonomy for the proxy core.
//!
//! `AuthRejected` is deliberately absent here: an authentication failure is not an
//! error, it's a `407` response produced by the auth gate (see `auth::AuthOutcome`).

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use thiserror::Error;

/// Error type shared by the session loop and its collaborators.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("client read error: {0}")]
    ClientRead(String),

    #[error("client write error: {0}")]
    ClientWrite(String),

    #[error("TLS handshake error: {0}")]
    TlsHandshake(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("unsupported upstream certificate for {host}: {reason}")]
    UnsupportedCert { host: String, reason: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

impl From<anyhow::Error> for ProxyError {
    fn from(err: anyhow::Error) -> Self {
        ProxyError::Upstream(err.to_string())
    }
}

impl ProxyError {
    /// Whether this error is recoverable at the request level (§7: synthesize an
    /// error response and keep the connection open) rather than fatal for the
    /// connection.
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            ProxyError::Upstream(_) | ProxyError::UnsupportedCert { .. } | ProxyError::InvalidUrl(_)
        )
    }
}

/// Run a handler-plugin future, converting a panic into `ProxyError::Handler`
/// (§7 `HandlerError`: "Handler callback raised"). Third-party handler code is
/// the one collaborator the core does not otherwise trust to behave — a panic
/// there must not take the whole connection task down silently.
///
/// Grounded in `rama_http::layer::catch_panic` (`other_examples`' sibling pack
/// repo `plabayo-rama`), adapted from a tower-style `Service` layer to a single
/// guarded `.await` around each of the four handler hooks.
pub async fn guard_handler_call<F, T>(fut: F) -> Result<T, ProxyError>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| ProxyError::Handler(panic_payload_message(payload)))
}

fn panic_payload_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}
