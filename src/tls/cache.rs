//! Leaf certificate caching

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::ca::LeafCertificate;

/// A cached certificate entry
struct CacheEntry {
    leaf: Arc<LeafCertificate>,
    created_at: Instant,
}

/// LRU cache of forged leaf certificates with a per-entry TTL
pub struct CertificateCache {
    cache: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl CertificateCache {
    /// Create a new certificate cache
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of certificates to cache (0 is treated as 1)
    /// * `ttl` - Time-to-live for cached certificates
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a certificate if it exists and hasn't expired. A hit marks it most recently used.
    pub fn get(&self, hostname: &str) -> Option<Arc<LeafCertificate>> {
        let mut cache = self.lock();

        if let Some(entry) = cache.get(hostname) {
            if entry.created_at.elapsed() < self.ttl {
                return Some(entry.leaf.clone());
            }
            cache.pop(hostname);
        }

        None
    }

    /// Store a certificate, evicting the least recently used entry when full
    pub fn put(&self, hostname: String, leaf: Arc<LeafCertificate>) {
        let mut cache = self.lock();

        if cache.len() >= cache.cap().get() && !cache.contains(&hostname) {
            let expired: Vec<String> = cache
                .iter()
                .filter(|(_, entry)| entry.created_at.elapsed() >= self.ttl)
                .map(|(host, _)| host.clone())
                .collect();
            for host in expired {
                cache.pop(&host);
            }
        }

        if let Some((evicted, _)) = cache.push(
            hostname.clone(),
            CacheEntry {
                leaf,
                created_at: Instant::now(),
            },
        ) {
            if evicted != hostname {
                tracing::debug!(hostname = %evicted, "Evicted certificate from cache");
            }
        }
    }

    /// Whether an unexpired entry exists, without touching recency
    pub fn contains(&self, hostname: &str) -> bool {
        self.lock()
            .peek(hostname)
            .is_some_and(|entry| entry.created_at.elapsed() < self.ttl)
    }

    /// Get the number of cached certificates
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    /// Clear all cached certificates
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for CertificateCache {
    fn default() -> Self {
        // 500 certs, 1 hour TTL
        Self::new(500, Duration::from_secs(60 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::CertificateDer;

    fn leaf(hostname: &str) -> Arc<LeafCertificate> {
        Arc::new(LeafCertificate {
            hostname: hostname.to_string(),
            cert_pem: format!("cert for {}", hostname),
            key_pem: format!("key for {}", hostname),
            cert_der: CertificateDer::from(hostname.as_bytes().to_vec()),
            key_der: hostname.as_bytes().to_vec(),
        })
    }

    #[test]
    fn test_cache_put_get() {
        let cache = CertificateCache::default();
        cache.put("example.com".to_string(), leaf("example.com"));

        let cached = cache.get("example.com").unwrap();
        assert_eq!(cached.cert_pem, "cert for example.com");
    }

    #[test]
    fn test_cache_miss() {
        let cache = CertificateCache::default();
        assert!(cache.get("nonexistent.com").is_none());
    }

    #[test]
    fn test_cache_expiration() {
        let cache = CertificateCache::new(100, Duration::from_millis(1));
        cache.put("example.com".to_string(), leaf("example.com"));

        std::thread::sleep(Duration::from_millis(10));

        assert!(!cache.contains("example.com"));
        assert!(cache.get("example.com").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_capacity() {
        let cache = CertificateCache::new(2, Duration::from_secs(3600));

        cache.put("one.com".to_string(), leaf("one.com"));
        cache.put("two.com".to_string(), leaf("two.com"));
        cache.put("three.com".to_string(), leaf("three.com"));

        assert!(cache.get("one.com").is_none());
        assert!(cache.get("two.com").is_some());
        assert!(cache.get("three.com").is_some());
    }

    #[test]
    fn test_eviction_follows_last_access() {
        let cache = CertificateCache::new(500, Duration::from_secs(3600));

        for i in 0..500 {
            let host = format!("host{}.example.com", i);
            cache.put(host.clone(), leaf(&host));
        }
        assert_eq!(cache.len(), 500);

        // host0 is the oldest insert; touching it makes host1 the LRU entry
        assert!(cache.get("host0.example.com").is_some());

        cache.put("host500.example.com".to_string(), leaf("host500.example.com"));

        assert_eq!(cache.len(), 500);
        assert!(!cache.contains("host1.example.com"));
        assert!(cache.contains("host0.example.com"));
        assert!(cache.contains("host2.example.com"));
        assert!(cache.contains("host500.example.com"));
    }

    #[test]
    fn test_expired_entry_evicted_before_live_lru() {
        let cache = CertificateCache::new(2, Duration::from_millis(50));

        cache.put("stale.com".to_string(), leaf("stale.com"));
        std::thread::sleep(Duration::from_millis(60));
        cache.put("live.com".to_string(), leaf("live.com"));

        // Touch stale so the LRU victim would be live.com if expiry were ignored
        {
            let mut inner = cache.lock();
            let _ = inner.get("stale.com");
        }

        cache.put("new.com".to_string(), leaf("new.com"));
        assert!(cache.contains("live.com"));
        assert!(cache.contains("new.com"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_replacing_existing_host_keeps_size() {
        let cache = CertificateCache::new(2, Duration::from_secs(3600));
        cache.put("one.com".to_string(), leaf("one.com"));
        cache.put("two.com".to_string(), leaf("two.com"));
        cache.put("two.com".to_string(), leaf("two.com"));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains("one.com"));
    }

    #[test]
    fn test_cache_len_and_clear() {
        let cache = CertificateCache::default();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.capacity(), 500);

        cache.put("example.com".to_string(), leaf("example.com"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
