//! Certificate minting for TLS interception.
//!
//! `CertFactory` is the spec's collaborator interface (§3 `CertConfig`): mint a
//! TLS server config for a given host, and expose the root CA's raw DER bytes for
//! the `/cert.crt` download (§4.3). `RcgenCertFactory` is this crate's default,
//! working implementation — real CA-signed leaf certificates, not the
//! fake-issuer-DN self-signed certs the teacher crate produced.

use crate::error::{ProxyError, ProxyResult};
use crate::tls::cache::{CertificateCache, MemoryCache};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::{Certificate as RustlsCertificate, PrivateKey, ServerConfig};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// A leaf certificate and its private key, DER-encoded.
#[derive(Debug, Clone)]
pub struct CertificateData {
    pub cert: RustlsCertificate,
    pub key: PrivateKey,
}

/// Mints per-host TLS server configs from a root CA (§3, §4.1, §4.4).
#[async_trait]
pub trait CertFactory: Send + Sync {
    /// Build a `rustls::ServerConfig` presenting a leaf certificate for `host`.
    async fn server_config_for_host(&self, host: &str) -> ProxyResult<Arc<ServerConfig>>;

    /// Raw DER bytes of the root CA certificate (§4.3 `/cert.crt`).
    fn root_ca_der(&self) -> &[u8];
}

/// Default `CertFactory`: an on-disk (or freshly generated) root CA, an
/// in-memory leaf-certificate cache, and real `rcgen` CA-signing.
pub struct RcgenCertFactory {
    ca_cert: Certificate,
    ca_der: Vec<u8>,
    cache: Box<dyn CertificateCache>,
    /// Built `ServerConfig`s, keyed by host, so repeat connections to the same
    /// host reuse the exact same config rather than rebuilding rustls state.
    config_cache: AsyncMutex<HashMap<String, Arc<ServerConfig>>>,
    organization: String,
    validity_days: u32,
    ttl_secs: u64,
}

impl RcgenCertFactory {
    /// Load the root CA from `ca_cert_path`/`ca_key_path`, generating and
    /// persisting a fresh one if neither exists.
    pub fn load_or_generate(
        ca_cert_path: &str,
        ca_key_path: &str,
        organization: &str,
        validity_days: u32,
        ttl_secs: u64,
    ) -> Result<Self> {
        let (ca_cert, ca_der) = if Path::new(ca_cert_path).exists() && Path::new(ca_key_path).exists()
        {
            info!("loading existing root CA from {}", ca_cert_path);
            load_ca(ca_cert_path, ca_key_path)?
        } else {
            info!("no root CA found at {}, generating one", ca_cert_path);
            let (cert, der) = generate_ca(organization)?;
            persist_ca(&cert, &der, ca_cert_path, ca_key_path)?;
            (cert, der)
        };

        Ok(Self {
            ca_cert,
            ca_der,
            cache: Box::new(MemoryCache::new(1000)),
            config_cache: AsyncMutex::new(HashMap::new()),
            organization: organization.to_string(),
            validity_days,
            ttl_secs,
        })
    }

    fn mint_leaf(&self, host: &str) -> Result<CertificateData> {
        let mut params = CertificateParams::new(vec![host.to_string()]);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, self.organization.as_str());
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        let now = SystemTime::now();
        params.not_before = now.into();
        params.not_after =
            (now + Duration::from_secs(self.validity_days as u64 * 24 * 60 * 60)).into();

        params.subject_alt_names = vec![SanType::DnsName(host.to_string())];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let leaf = Certificate::from_params(params)
            .map_err(|e| anyhow!("failed to build leaf certificate params: {}", e))?;

        let cert_der = leaf
            .serialize_der_with_signer(&self.ca_cert)
            .map_err(|e| anyhow!("failed to sign leaf certificate for {}: {}", host, e))?;
        let key_der = leaf.serialize_private_key_der();

        Ok(CertificateData {
            cert: RustlsCertificate(cert_der),
            key: PrivateKey(key_der),
        })
    }
}

#[async_trait]
impl CertFactory for RcgenCertFactory {
    async fn server_config_for_host(&self, host: &str) -> ProxyResult<Arc<ServerConfig>> {
        let host = host.to_string();

        {
            let configs = self.config_cache.lock().await;
            if let Some(config) = configs.get(&host) {
                debug!("TLS server config cache hit for {}", host);
                return Ok(config.clone());
            }
        }

        let cert_data = match self.cache.get(&host) {
            Ok(Some(cert_data)) => {
                debug!("leaf certificate material cache hit for {}", host);
                cert_data
            }
            _ => {
                let cert_data = self
                    .mint_leaf(&host)
                    .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
                if let Err(e) = self.cache.set(&host, cert_data.clone(), self.ttl_secs) {
                    warn!("failed to cache leaf certificate for {}: {}", host, e);
                }
                cert_data
            }
        };

        let config = Arc::new(
            build_server_config(cert_data).map_err(|e| ProxyError::TlsHandshake(e.to_string()))?,
        );
        self.config_cache
            .lock()
            .await
            .insert(host, config.clone());
        Ok(config)
    }

    fn root_ca_der(&self) -> &[u8] {
        &self.ca_der
    }
}

fn build_server_config(cert_data: CertificateData) -> Result<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![cert_data.cert], cert_data.key)
        .context("failed to build TLS server config")?;
    // Client-side HTTP/2 is a non-goal (SPEC_FULL.md §1); only ever advertise 1.1.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn generate_ca(organization: &str) -> Result<(Certificate, Vec<u8>)> {
    let mut params = CertificateParams::new(vec![]);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, organization);
    dn.push(DnType::CommonName, format!("{organization} Root CA"));
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + Duration::from_secs(10 * 365 * 24 * 60 * 60)).into();

    let cert = Certificate::from_params(params)
        .map_err(|e| anyhow!("failed to generate root CA: {}", e))?;
    let der = cert
        .serialize_der()
        .map_err(|e| anyhow!("failed to serialize root CA: {}", e))?;
    Ok((cert, der))
}

/// Reconstruct the CA's `rcgen::Certificate` (keypair + distinguished name) from
/// its on-disk PEM cert and key, so it can be used as a signer. rcgen signs using
/// its own in-memory `Certificate` object, not the raw on-disk bytes, so the
/// reconstructed params only need to carry the same key pair and subject.
fn load_ca(ca_cert_path: &str, ca_key_path: &str) -> Result<(Certificate, Vec<u8>)> {
    let cert_pem = fs::read_to_string(ca_cert_path)
        .with_context(|| format!("failed to read CA cert at {}", ca_cert_path))?;
    let key_pem = fs::read_to_string(ca_key_path)
        .with_context(|| format!("failed to read CA key at {}", ca_key_path))?;

    let der = pem_to_der(&cert_pem)?;
    let (org, cn) = subject_from_der(&der)?;

    let key_pair =
        KeyPair::from_pem(&key_pem).map_err(|e| anyhow!("failed to parse CA private key: {}", e))?;

    let mut params = CertificateParams::from_ca_cert_der(&der, key_pair)
        .map_err(|e| anyhow!("failed to reconstruct CA certificate: {}", e))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, org);
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

    let cert = Certificate::from_params(params)
        .map_err(|e| anyhow!("failed to rebuild CA certificate object: {}", e))?;
    Ok((cert, der))
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    let certs =
        rustls_pemfile::certs(&mut reader).map_err(|e| anyhow!("failed to parse CA PEM: {}", e))?;
    certs
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no certificate found in CA PEM"))
}

fn subject_from_der(der: &[u8]) -> Result<(String, String)> {
    use x509_parser::prelude::*;
    let (_, parsed) = X509Certificate::from_der(der).map_err(|e| anyhow!("invalid CA DER: {}", e))?;
    let subject = parsed.subject();
    let org = subject
        .iter_organization()
        .next()
        .and_then(|a| a.as_str().ok())
        .unwrap_or("MITM Proxy Core")
        .to_string();
    let cn = subject
        .iter_common_name()
        .next()
        .and_then(|a| a.as_str().ok())
        .unwrap_or("MITM Proxy Core Root CA")
        .to_string();
    Ok((org, cn))
}

/// Write the CA cert (0644) and key (0600) atomically: a temp file plus a
/// hard-link-based create-new rename avoids a TOCTOU window where a concurrent
/// process could overwrite an existing CA with a fresh, differently-keyed one.
fn persist_ca(cert: &Certificate, der: &[u8], cert_path: &str, key_path: &str) -> Result<()> {
    if let Some(parent) = Path::new(cert_path).parent() {
        fs::create_dir_all(parent)?;
    }
    if let Some(parent) = Path::new(key_path).parent() {
        fs::create_dir_all(parent)?;
    }

    let cert_pem = der_to_pem(der, "CERTIFICATE");
    let key_pem = cert.serialize_private_key_pem();

    write_atomic_create_new(cert_path, cert_pem.as_bytes(), 0o644)?;
    write_atomic_create_new(key_path, key_pem.as_bytes(), 0o600)?;
    Ok(())
}

fn write_atomic_create_new(path: &str, contents: &[u8], mode: u32) -> Result<()> {
    let path = PathBuf::from(path);
    let tmp_path = path.with_extension("tmp-new");

    {
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(contents)?;
        tmp.set_permissions(fs::Permissions::from_mode(mode))?;
        tmp.sync_all()?;
    }

    match fs::hard_link(&tmp_path, &path) {
        Ok(()) => {
            let _ = fs::remove_file(&tmp_path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&tmp_path);
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(e.into())
        }
    }
}

fn der_to_pem(der: &[u8], label: &str) -> String {
    use base64::{engine::general_purpose, Engine as _};
    let b64 = general_purpose::STANDARD.encode(der);
    let lines: Vec<&str> = b64.as_bytes().chunks(64).map(|c| std::str::from_utf8(c).unwrap_or("")).collect();
    format!("-----BEGIN {label}-----\n{}\n-----END {label}-----\n", lines.join("\n"))
}

/// PEM-encode the root CA for the `/cert.crt` download (§4.3, §6).
pub fn ca_to_pem(der: &[u8]) -> String {
    der_to_pem(der, "CERTIFICATE")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn mints_a_leaf_cert_for_each_host() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");

        let factory = RcgenCertFactory::load_or_generate(
            cert_path.to_str().unwrap(),
            key_path.to_str().unwrap(),
            "Test Org",
            365,
            3600,
        )
        .unwrap();

        let config_a = factory.server_config_for_host("a.example.test").await.unwrap();
        let config_b = factory.server_config_for_host("b.example.test").await.unwrap();
        assert!(!Arc::ptr_eq(&config_a, &config_b));
        assert!(!factory.root_ca_der().is_empty());
    }

    #[tokio::test]
    async fn reuses_cached_leaf_cert_for_same_host() {
        let dir = tempdir().unwrap();
        let factory = RcgenCertFactory::load_or_generate(
            dir.path().join("ca.crt").to_str().unwrap(),
            dir.path().join("ca.key").to_str().unwrap(),
            "Test Org",
            365,
            3600,
        )
        .unwrap();

        let first = factory.server_config_for_host("cached.example.test").await.unwrap();
        let second = factory.server_config_for_host("cached.example.test").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn pem_round_trips_der() {
        let der = vec![1u8, 2, 3, 4, 5];
        let pem = ca_to_pem(&der);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(pem.trim_end().ends_with("-----END CERTIFICATE-----"));
    }
}
