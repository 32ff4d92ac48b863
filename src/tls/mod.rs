//! TLS certificate management and interception support.

pub mod cache;
pub mod cert_gen;
pub mod config;

pub use cache::CertificateCache;
pub use cert_gen::{CertFactory, CertificateData, RcgenCertFactory};
pub use config::build_client_config;
