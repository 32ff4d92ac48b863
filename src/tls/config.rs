//! TLS client configuration for upstream dispatch.
//!
//! Per-host server configs live in `tls::cert_gen`; this module only builds the
//! `rustls::ClientConfig` the upstream dispatcher uses to speak TLS to real
//! origin servers.

use anyhow::Result;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, RootCertStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Build a `ClientConfig` trusting the system root store, for dispatching
/// requests to real upstream servers over HTTPS.
pub fn build_client_config() -> Result<Arc<ClientConfig>> {
    debug!("building upstream TLS client configuration");

    let mut root_store = RootCertStore::empty();
    add_system_root_certificates(&mut root_store);

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

fn add_system_root_certificates(root_store: &mut RootCertStore) {
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let mut added = 0;
            for cert_der in certs {
                if root_store.add(&Certificate(cert_der.to_vec())).is_ok() {
                    added += 1;
                }
            }
            info!("loaded {} system root certificates", added);
        }
        Err(e) => {
            warn!("could not load system root certificates: {}", e);
        }
    }
}

/// A verifier that accepts any certificate — used only by this crate's own
/// integration tests, which dispatch to an in-process TLS server presenting a
/// certificate the system root store has no reason to trust (§7 `UnsupportedCert`
/// is exercised deliberately this way, not worked around).
#[cfg(test)]
pub struct AcceptAllCertVerifier;

#[cfg(test)]
impl ServerCertVerifier for AcceptAllCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
pub fn insecure_client_config() -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAllCertVerifier))
            .with_no_client_auth(),
    )
}
