//! Per-host certificate store with coalesced generation

use futures_util::future::{BoxFuture, FutureExt, Shared};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::ca::{CertificateAuthority, LeafCertificate, RootCertificate};
use super::cache::CertificateCache;
use crate::error::{Error, Result};

/// Name whose certificate is presented when a client sends no SNI
pub const DEFAULT_SERVER_NAME: &str = "internal_https_server";

type PendingLeaf = Shared<BoxFuture<'static, std::result::Result<Arc<LeafCertificate>, String>>>;

/// Hands out the root and forged leaf certificates.
///
/// The root is held outside the cache and cannot be evicted. Leaves live in an
/// LRU with a TTL; concurrent requests for the same uncached host share one
/// generation through the in-flight map.
pub struct CertificateStore {
    ca: Arc<CertificateAuthority>,
    cache: Arc<CertificateCache>,
    in_flight: Arc<Mutex<HashMap<String, PendingLeaf>>>,
    validity_days: i64,
    generations: Arc<AtomicUsize>,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("cache_size", &self.cache.len())
            .field("generations", &self.generation_count())
            .finish()
    }
}

impl CertificateStore {
    /// Store with the default cache (500 entries, 1 hour) and 365-day leaves
    pub fn new(ca: CertificateAuthority) -> Self {
        Self::with_cache(ca, 500, Duration::from_secs(60 * 60), 365)
    }

    /// Create with custom cache settings
    pub fn with_cache(
        ca: CertificateAuthority,
        cache_capacity: usize,
        cache_ttl: Duration,
        validity_days: i64,
    ) -> Self {
        Self {
            ca: Arc::new(ca),
            cache: Arc::new(CertificateCache::new(cache_capacity, cache_ttl)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            validity_days,
            generations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The operator's root certificate
    pub fn get_root(&self) -> &RootCertificate {
        self.ca.root()
    }

    /// Get the cached leaf for `hostname` or generate one
    pub async fn get_leaf(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
        let hostname = normalize_hostname(hostname);

        if let Some(leaf) = self.cache.get(&hostname) {
            tracing::debug!(hostname = %hostname, "Using cached certificate");
            return Ok(leaf);
        }

        let pending = {
            let mut in_flight = lock(&self.in_flight);
            // A generation may have landed between the miss above and taking the lock
            if let Some(leaf) = self.cache.get(&hostname) {
                return Ok(leaf);
            }
            match in_flight.get(&hostname) {
                Some(pending) => {
                    tracing::debug!(hostname = %hostname, "Joining in-flight certificate generation");
                    pending.clone()
                }
                None => {
                    let pending = self.generate(hostname.clone());
                    in_flight.insert(hostname.clone(), pending.clone());
                    pending
                }
            }
        };

        pending.await.map_err(Error::certificate)
    }

    /// Build a rustls server config presenting `[leaf, root]` for `hostname`
    pub async fn server_config_for_host(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
        let leaf = self.get_leaf(hostname).await?;

        let cert_chain = vec![leaf.cert_der.clone(), self.ca.cert_der().clone()];

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::tls(format!("Failed to select protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, leaf.private_key_der())
            .map_err(|e| Error::tls(format!("Failed to build server config: {}", e)))?;

        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    /// Number of leaf certificates generated since startup
    pub fn generation_count(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }

    /// Get cache statistics
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Get the CA certificate for client trust
    pub fn ca_cert_der(&self) -> &rustls::pki_types::CertificateDer<'static> {
        self.ca.cert_der()
    }

    fn generate(&self, hostname: String) -> PendingLeaf {
        let ca = self.ca.clone();
        let cache = self.cache.clone();
        let in_flight = self.in_flight.clone();
        let generations = self.generations.clone();
        let validity_days = self.validity_days;

        async move {
            tracing::debug!(hostname = %hostname, "Generating new certificate");

            let host = hostname.clone();
            let joined = tokio::task::spawn_blocking(move || {
                generations.fetch_add(1, Ordering::SeqCst);
                ca.issue_leaf(&host, validity_days)
            })
            .await;

            let result = match joined {
                Ok(Ok(leaf)) => {
                    let leaf = Arc::new(leaf);
                    cache.put(hostname.clone(), leaf.clone());
                    Ok(leaf)
                }
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(format!("Certificate generation task failed: {}", e)),
            };

            // Cached before the slot is cleared; a lookup always finds one of the two
            lock(&in_flight).remove(&hostname);

            if let Err(ref e) = result {
                tracing::warn!(hostname = %hostname, error = %e, "Certificate generation failed");
            }
            result
        }
        .boxed()
        .shared()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lowercase, strip a trailing dot and IPv6 brackets. Empty names map to the default server name.
pub fn normalize_hostname(hostname: &str) -> String {
    let trimmed = hostname.trim().trim_end_matches('.');
    let trimmed = trimmed
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(trimmed);

    if trimmed.is_empty() {
        DEFAULT_SERVER_NAME.to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}
