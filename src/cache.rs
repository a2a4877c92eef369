//! Reference-counted sharing of secret providers across connections.
//!
//! The cache keys live providers by [`TlsContextDescriptor`] equality.
//! Every `find_or_create` either joins an existing acquisition or starts
//! a new one; dropping the returned [`ProviderHandle`] releases the
//! reference, and the last release cancels the acquisition and evicts
//! the entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::context::{CertSource, TlsContextDescriptor};
use crate::error::{Error, Result};
use crate::material::{self, TlsMaterial};
use crate::prelude::{debug, info, warn};
use crate::provider::{SecretCallback, SecretFetcher, SecretProvider};

struct CacheEntry {
    provider: Arc<SecretProvider>,
    refs: usize,
}

struct CacheShared {
    runtime: tokio::runtime::Handle,
    fetcher: Option<Arc<dyn SecretFetcher>>,
    closed: AtomicBool,
    entries: Mutex<HashMap<TlsContextDescriptor, CacheEntry>>,
}

impl CacheShared {
    fn release(&self, descriptor: &TlsContextDescriptor) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(descriptor) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }
        if let Some(entry) = entries.remove(descriptor) {
            drop(entries);
            debug!("last reference released, cancelling provider");
            entry.provider.cancel();
        }
    }
}

/// Shared, cloneable cache of [`SecretProvider`]s.
#[derive(Clone)]
pub struct SecretProviderCache {
    shared: Arc<CacheShared>,
}

impl std::fmt::Debug for SecretProviderCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretProviderCache")
            .field("len", &self.len())
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl SecretProviderCache {
    /// A cache that can serve static contexts only. Discovery contexts
    /// fail provider construction until a fetcher is supplied via
    /// [`SecretProviderCache::with_fetcher`].
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self::build(runtime, None)
    }

    /// A cache that resolves discovery contexts through `fetcher`.
    pub fn with_fetcher(runtime: tokio::runtime::Handle, fetcher: Arc<dyn SecretFetcher>) -> Self {
        Self::build(runtime, Some(fetcher))
    }

    fn build(runtime: tokio::runtime::Handle, fetcher: Option<Arc<dyn SecretFetcher>>) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                runtime,
                fetcher,
                closed: AtomicBool::new(false),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns a handle on the provider for `descriptor`, starting an
    /// acquisition if no connection currently holds one.
    ///
    /// ## Errors
    ///
    /// Fails synchronously with [`Error::ProviderCreationFailed`] when
    /// the descriptor cannot produce a provider at all (malformed inline
    /// PEM, or a discovery context with no fetcher configured), and with
    /// [`Error::Closed`] after [`SecretProviderCache::shutdown`].
    pub fn find_or_create(&self, descriptor: &TlsContextDescriptor) -> Result<ProviderHandle> {
        let mut entries = self
            .shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Checked under the lock: shutdown flips the flag before it
        // drains the map, so a lookup either lands before the drain or
        // sees the cache closed.
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        if let Some(entry) = entries.get_mut(descriptor) {
            entry.refs += 1;
            debug!("joining existing provider ({} refs)", entry.refs);
            return Ok(ProviderHandle {
                provider: Arc::clone(&entry.provider),
                descriptor: descriptor.clone(),
                cache: Arc::downgrade(&self.shared),
            });
        }

        let provider = Arc::new(self.create_provider(descriptor)?);
        info!("created secret provider for new context descriptor");
        entries.insert(
            descriptor.clone(),
            CacheEntry {
                provider: Arc::clone(&provider),
                refs: 1,
            },
        );
        Ok(ProviderHandle {
            provider,
            descriptor: descriptor.clone(),
            cache: Arc::downgrade(&self.shared),
        })
    }

    fn create_provider(&self, descriptor: &TlsContextDescriptor) -> Result<SecretProvider> {
        match &descriptor.cert_source {
            CertSource::StaticPem {
                cert_chain_pem,
                private_key_pem,
                trust_roots_pem,
            } => {
                let material = material::from_pem(
                    cert_chain_pem.as_deref(),
                    private_key_pem.as_deref(),
                    trust_roots_pem.as_deref(),
                )
                .map_err(|e| Error::ProviderCreationFailed(e.to_string()))?;
                Ok(SecretProvider::ready(material))
            }
            CertSource::StaticFiles {
                cert_chain,
                private_key,
                trust_roots,
            } => {
                let cert_chain = cert_chain.clone();
                let private_key = private_key.clone();
                let trust_roots = trust_roots.clone();
                Ok(SecretProvider::spawn(
                    &self.shared.runtime,
                    Box::pin(async move {
                        let cert_pem = read_optional(cert_chain.as_deref()).await?;
                        let key_pem = read_optional(private_key.as_deref()).await?;
                        let roots_pem = read_optional(trust_roots.as_deref()).await?;
                        material::from_pem(
                            cert_pem.as_deref(),
                            key_pem.as_deref(),
                            roots_pem.as_deref(),
                        )
                    }),
                ))
            }
            CertSource::Discovery {
                secret_name,
                source,
            } => {
                let fetcher = self.shared.fetcher.as_ref().ok_or_else(|| {
                    Error::ProviderCreationFailed(
                        "discovery context but no secret fetcher configured".to_string(),
                    )
                })?;
                Ok(SecretProvider::spawn(
                    &self.shared.runtime,
                    fetcher.fetch(secret_name, source),
                ))
            }
        }
    }

    /// Cancels every live provider and refuses further lookups.
    /// Idempotent; handles released afterwards are no-ops.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries = {
            let mut entries = self
                .shared
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *entries)
        };
        if !entries.is_empty() {
            warn!("shutting down cache with {} live provider(s)", entries.len());
        }
        for entry in entries.into_values() {
            entry.provider.cancel();
        }
    }

    /// Number of live cache entries.
    pub fn len(&self) -> usize {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when no entry is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current reference count for `descriptor`, zero when absent.
    pub fn ref_count(&self, descriptor: &TlsContextDescriptor) -> usize {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(descriptor)
            .map_or(0, |entry| entry.refs)
    }
}

async fn read_optional(path: Option<&std::path::Path>) -> Result<Option<String>> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .map(Some)
            .map_err(|e| {
                Error::SecretDeliveryFailed(format!("reading {}: {e}", path.display()))
            }),
        None => Ok(None),
    }
}

/// One connection's reference to a cached [`SecretProvider`].
///
/// Dropping the handle releases the reference; the last handle for a
/// descriptor cancels the underlying acquisition.
pub struct ProviderHandle {
    provider: Arc<SecretProvider>,
    descriptor: TlsContextDescriptor,
    cache: Weak<CacheShared>,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("provider", &self.provider)
            .finish()
    }
}

impl ProviderHandle {
    /// Registers a delivery callback with the underlying provider.
    pub fn register(&self, callback: SecretCallback) {
        self.provider.register(callback);
    }

    /// The delivered material, if acquisition already succeeded.
    pub fn material(&self) -> Option<Arc<TlsMaterial>> {
        self.provider.material()
    }

    /// Releases the reference. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Drop for ProviderHandle {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.release(&self.descriptor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DiscoverySource;
    use crate::provider::BoxFuture;
    use std::sync::atomic::AtomicUsize;

    fn pem_descriptor(trust_roots_pem: &str) -> TlsContextDescriptor {
        TlsContextDescriptor::new(CertSource::StaticPem {
            cert_chain_pem: None,
            private_key_pem: None,
            trust_roots_pem: Some(trust_roots_pem.to_string()),
        })
    }

    fn discovery_descriptor(name: &str) -> TlsContextDescriptor {
        TlsContextDescriptor::new(CertSource::Discovery {
            secret_name: name.to_string(),
            source: DiscoverySource {
                server_uri: "unix:///run/sds.sock".to_string(),
            },
        })
    }

    fn root_pem() -> String {
        let key = rcgen::KeyPair::generate().expect("generate key");
        let params = rcgen::CertificateParams::default();
        params.self_signed(&key).expect("self-sign").pem()
    }

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    impl SecretFetcher for CountingFetcher {
        fn fetch(&self, _: &str, _: &DiscoverySource) -> BoxFuture<'static, Result<TlsMaterial>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn same_descriptor_shares_one_provider() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let cache =
            SecretProviderCache::with_fetcher(tokio::runtime::Handle::current(), fetcher.clone());

        let descriptor = discovery_descriptor("server-cert");
        let a = cache.find_or_create(&descriptor).expect("first handle");
        let b = cache.find_or_create(&descriptor).expect("second handle");

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.ref_count(&descriptor), 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        drop(a);
        assert_eq!(cache.ref_count(&descriptor), 1);
        drop(b);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn unequal_descriptors_get_distinct_providers() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let cache =
            SecretProviderCache::with_fetcher(tokio::runtime::Handle::current(), fetcher.clone());

        let _a = cache
            .find_or_create(&discovery_descriptor("server-cert"))
            .expect("handle");
        let _b = cache
            .find_or_create(&discovery_descriptor("client-cert"))
            .expect("handle");

        assert_eq!(cache.len(), 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn release_then_find_creates_a_fresh_acquisition() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let cache =
            SecretProviderCache::with_fetcher(tokio::runtime::Handle::current(), fetcher.clone());

        let descriptor = discovery_descriptor("server-cert");
        drop(cache.find_or_create(&descriptor).expect("handle"));
        let _again = cache.find_or_create(&descriptor).expect("handle");

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_inline_pem_fails_synchronously() {
        let cache = SecretProviderCache::new(tokio::runtime::Handle::current());
        let err = cache
            .find_or_create(&pem_descriptor("not pem at all"))
            .expect_err("should fail");
        assert!(matches!(err, Error::ProviderCreationFailed(_)));
        assert!(cache.is_empty(), "failed construction must not leave an entry");
    }

    #[tokio::test]
    async fn discovery_without_fetcher_fails_synchronously() {
        let cache = SecretProviderCache::new(tokio::runtime::Handle::current());
        let err = cache
            .find_or_create(&discovery_descriptor("server-cert"))
            .expect_err("should fail");
        assert!(matches!(err, Error::ProviderCreationFailed(_)));
    }

    #[tokio::test]
    async fn valid_inline_pem_is_delivered_immediately() {
        let cache = SecretProviderCache::new(tokio::runtime::Handle::current());
        let handle = cache
            .find_or_create(&pem_descriptor(&root_pem()))
            .expect("handle");
        let material = handle.material().expect("static material is ready");
        assert_eq!(material.trust_roots.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_lookups_and_is_idempotent() {
        let cache = SecretProviderCache::new(tokio::runtime::Handle::current());
        let handle = cache
            .find_or_create(&pem_descriptor(&root_pem()))
            .expect("handle");

        cache.shutdown();
        cache.shutdown();

        assert!(matches!(
            cache.find_or_create(&pem_descriptor(&root_pem())),
            Err(Error::Closed)
        ));
        assert!(cache.is_empty());
        drop(handle); // release after shutdown is a no-op
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_entry() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let cache =
            SecretProviderCache::with_fetcher(tokio::runtime::Handle::current(), fetcher.clone());
        let descriptor = discovery_descriptor("server-cert");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let descriptor = descriptor.clone();
            tasks.push(tokio::spawn(async move {
                cache.find_or_create(&descriptor).expect("handle")
            }));
        }
        let handles: Vec<_> = futures_join_all(tasks).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.ref_count(&descriptor), 16);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        drop(handles);
        assert!(cache.is_empty());
    }

    async fn futures_join_all(
        tasks: Vec<tokio::task::JoinHandle<ProviderHandle>>,
    ) -> Vec<ProviderHandle> {
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            out.push(task.await.expect("task panicked"));
        }
        out
    }
}
