//! Proxy authentication gate (§4.2).
//!
//! `AuthCache` maps an opaque credential fingerprint to a validity boolean (§3);
//! its trait shape follows the same "pluggable backend behind a small trait"
//! idiom as `tls::cache::CertificateCache`. `InMemoryAuthCache` is the default,
//! in-process implementation.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::RwLock;

/// Validates `Proxy-Authorization` header values against cached credentials.
#[async_trait]
pub trait AuthCache: Send + Sync {
    /// `true` if `credential` (the raw `Proxy-Authorization` header value) is
    /// currently accepted.
    async fn is_valid(&self, credential: &str) -> bool;
}

/// A `HashSet`-backed cache of accepted credential fingerprints.
pub struct InMemoryAuthCache {
    accepted: RwLock<HashSet<String>>,
}

impl InMemoryAuthCache {
    pub fn new() -> Self {
        Self {
            accepted: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_credentials(credentials: impl IntoIterator<Item = String>) -> Self {
        Self {
            accepted: RwLock::new(credentials.into_iter().collect()),
        }
    }

    pub async fn accept(&self, credential: impl Into<String>) {
        self.accepted.write().await.insert(credential.into());
    }

    pub async fn revoke(&self, credential: &str) {
        self.accepted.write().await.remove(credential);
    }
}

impl Default for InMemoryAuthCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthCache for InMemoryAuthCache {
    async fn is_valid(&self, credential: &str) -> bool {
        self.accepted.read().await.contains(credential)
    }
}

/// Outcome of the authentication gate (§4.2). `Rejected` is not an error (§7) —
/// it is a ready-to-write `407` response.
pub enum AuthOutcome {
    Accepted,
    Rejected,
}

/// Consults `cache` with the request's `Proxy-Authorization` header, if any.
pub async fn check(cache: &dyn AuthCache, proxy_authorization: Option<&str>) -> AuthOutcome {
    match proxy_authorization {
        Some(credential) if cache.is_valid(credential).await => AuthOutcome::Accepted,
        _ => AuthOutcome::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_credential_is_rejected() {
        let cache = InMemoryAuthCache::new();
        assert!(matches!(check(&cache, Some("Basic xyz")).await, AuthOutcome::Rejected));
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let cache = InMemoryAuthCache::new();
        assert!(matches!(check(&cache, None).await, AuthOutcome::Rejected));
    }

    #[tokio::test]
    async fn accepted_credential_passes() {
        let cache = InMemoryAuthCache::new();
        cache.accept("Basic xyz").await;
        assert!(matches!(check(&cache, Some("Basic xyz")).await, AuthOutcome::Accepted));
    }
}
