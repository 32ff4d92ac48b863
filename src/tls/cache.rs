//! In-memory leaf-certificate cache (§10.4).
//!
//! Grounded in the teacher's `CertificateCache` trait and `MemoryCache`
//! (`tls/cache.rs`); the Redis-backed variant is dropped (see `DESIGN.md`) since
//! nothing in the transformed crate needs a shared, cross-process certificate
//! store — the default `RcgenCertFactory` is process-local.

use crate::tls::cert_gen::CertificateData;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Debug, Clone)]
struct CachedCertificate {
    cert_data: CertificateData,
    created_at: u64,
    expires_at: u64,
}

/// Certificate cache backend trait.
pub trait CertificateCache: Send + Sync {
    fn get(&self, domain: &str) -> Result<Option<CertificateData>>;
    fn set(&self, domain: &str, cert_data: CertificateData, ttl_seconds: u64) -> Result<()>;
    fn remove(&self, domain: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn cache_info(&self) -> String;
}

pub struct MemoryCache {
    cache: Mutex<HashMap<String, CachedCertificate>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        debug!("creating in-memory certificate cache (max_entries: {})", max_entries);
        Self {
            cache: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_secs()
    }

    fn cleanup_expired(&self) {
        let now = Self::current_timestamp();
        let mut cache = self.cache.lock().unwrap();
        cache.retain(|_, entry| now < entry.expires_at);
    }

    fn enforce_size_limit(&self) {
        let mut cache = self.cache.lock().unwrap();
        if cache.len() > self.max_entries {
            let mut entries: Vec<(String, u64)> = cache
                .iter()
                .map(|(domain, entry)| (domain.clone(), entry.created_at))
                .collect();
            entries.sort_by_key(|(_, created_at)| *created_at);

            let to_remove = cache.len() - self.max_entries;
            for (domain, _) in entries.iter().take(to_remove) {
                cache.remove(domain);
            }
        }
    }
}

impl CertificateCache for MemoryCache {
    fn get(&self, domain: &str) -> Result<Option<CertificateData>> {
        self.cleanup_expired();
        let cache = self.cache.lock().unwrap();
        Ok(cache.get(domain).map(|entry| entry.cert_data.clone()))
    }

    fn set(&self, domain: &str, cert_data: CertificateData, ttl_seconds: u64) -> Result<()> {
        let now = Self::current_timestamp();
        let entry = CachedCertificate {
            cert_data,
            created_at: now,
            expires_at: now + ttl_seconds,
        };
        {
            let mut cache = self.cache.lock().unwrap();
            cache.insert(domain.to_string(), entry);
        }
        self.enforce_size_limit();
        Ok(())
    }

    fn remove(&self, domain: &str) -> Result<()> {
        self.cache.lock().unwrap().remove(domain);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.cache.lock().unwrap().clear();
        Ok(())
    }

    fn cache_info(&self) -> String {
        let cache = self.cache.lock().unwrap();
        format!("memory cache: {}/{} entries", cache.len(), self.max_entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::{Certificate as RustlsCertificate, PrivateKey};

    fn fixture(n: u8) -> CertificateData {
        CertificateData {
            cert: RustlsCertificate(vec![n]),
            key: PrivateKey(vec![n]),
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = MemoryCache::new(10);
        assert!(cache.get("example.test").unwrap().is_none());
        cache.set("example.test", fixture(1), 3600).unwrap();
        assert!(cache.get("example.test").unwrap().is_some());
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = MemoryCache::new(10);
        cache.set("example.test", fixture(1), 0).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(cache.get("example.test").unwrap().is_none());
    }

    #[test]
    fn enforces_size_limit() {
        let cache = MemoryCache::new(2);
        cache.set("a", fixture(1), 3600).unwrap();
        cache.set("b", fixture(2), 3600).unwrap();
        cache.set("c", fixture(3), 3600).unwrap();
        assert!(cache.cache_info().starts_with("memory cache: 2/2"));
    }
}
