//! The [ArtworkCache] ties the tiers together: one memory tier, one durable namespace, one deduplicator and one
//! prefetch scheduler, all sharing a single [ArtworkCacheConfig].
//!
//! It is an ordinary value rather than a global.  Build one at the composition root of the application, clone it
//! into whatever needs it (clones share everything), and flush or dispose of it explicitly.
//!
//! Lookups go:
//!
//! - First, the memory tier, synchronously.
//! - Next, any resolution already in flight for the same key.
//! - Then the durable tier.
//! - Finally the network, persisting what comes back.
//!
//! Anything that goes wrong along the way turns into `None`, and the caller shows the raw URL instead.
use std::collections::HashSet;
use std::sync::Arc;

use ahash::RandomState;
use log::debug;
use parking_lot::Mutex;

use crate::*;

struct CacheShared {
    config: ArtworkCacheConfig,
    keys: KeyBuilder,
    memory: Arc<Mutex<MemoryCache>>,
    durable: DurableCache,
    dedup: Deduplicator,
    scheduler: PrefetchScheduler,
    /// Paths that reached their final resolution at least once this session.
    fully_loaded: Mutex<HashSet<String, RandomState>>,
}

#[derive(Clone)]
pub struct ArtworkCache {
    shared: Arc<CacheShared>,
}

/// A snapshot of what the cache is holding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_entries: usize,
    /// Memory entries somebody is displaying.
    pub referenced_entries: usize,
    pub pending_requests: usize,
    /// Keys submitted to the prefetch scheduler this session.
    pub prefetched_keys: usize,
    pub fully_loaded_paths: usize,
}

/// What a flush got rid of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushReport {
    pub memory_entries_released: usize,
    /// False if deleting the durable namespace failed.  The failure has been logged.
    pub durable_cleared: bool,
}

impl ArtworkCache {
    pub fn new(
        config: ArtworkCacheConfig,
        store: Arc<dyn DurableStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> ArtworkCache {
        let keys = KeyBuilder::new(&config.origin);
        let memory = Arc::new(Mutex::new(MemoryCache::new(
            config.memory_capacity,
            config.eviction_batch,
        )));
        let durable = if config.durable_enabled {
            DurableCache::new(store, &config.namespace, keys.clone())
        } else {
            DurableCache::disabled(&config.namespace, keys.clone())
        };
        let dedup = Deduplicator::new(memory.clone(), durable.clone(), fetcher);
        let scheduler = PrefetchScheduler::new(dedup.clone(), keys.clone(), &config);

        ArtworkCache {
            shared: Arc::new(CacheShared {
                config,
                keys,
                memory,
                durable,
                dedup,
                scheduler,
                fully_loaded: Default::default(),
            }),
        }
    }

    pub fn config(&self) -> &ArtworkCacheConfig {
        &self.shared.config
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.shared.keys
    }

    pub fn memory(&self) -> &Arc<Mutex<MemoryCache>> {
        &self.shared.memory
    }

    pub fn durable(&self) -> &DurableCache {
        &self.shared.durable
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.shared.dedup
    }

    pub fn scheduler(&self) -> &PrefetchScheduler {
        &self.shared.scheduler
    }

    pub fn build_key(&self, path: &str, tier: &str) -> Option<ResourceKey> {
        self.shared.keys.build_key(path, tier)
    }

    /// Synchronous memory-tier lookup.  Doesn't touch the reference count.
    pub fn cached(&self, key: &ResourceKey) -> Option<ObjectHandle> {
        self.shared.memory.lock().get(key)
    }

    pub async fn resolve(&self, key: &ResourceKey) -> Option<ObjectHandle> {
        self.shared.dedup.resolve(key).await
    }

    pub async fn acquire(&self, key: &ResourceKey) -> Option<Lease> {
        self.shared.dedup.acquire(key).await
    }

    /// Is the key in either tier?  Never goes to the network.
    pub async fn is_cached(&self, key: &ResourceKey) -> bool {
        let in_memory = self.shared.memory.lock().contains(key);
        in_memory || self.shared.durable.contains(key).await
    }

    /// Tell deferred prefetches that now is a good time to run.
    pub fn notify_idle(&self) {
        self.shared.scheduler.notify_idle();
    }

    pub fn stats(&self) -> CacheStats {
        let (memory_entries, referenced_entries) = {
            let memory = self.shared.memory.lock();
            (memory.len(), memory.referenced_len())
        };
        CacheStats {
            memory_entries,
            referenced_entries,
            pending_requests: self.shared.dedup.pending_len(),
            prefetched_keys: self.shared.scheduler.requested_len(),
            fully_loaded_paths: self.shared.fully_loaded.lock().len(),
        }
    }

    /// Flush every tier.
    ///
    /// Every memory entry is released whether or not it is displayed, the durable namespace is deleted, and the
    /// session's prefetch bookkeeping is forgotten.  Resolutions still in flight deliver to their waiters but cache
    /// nothing.
    pub async fn clear_all(&self) -> FlushReport {
        let released = self.forget_session();
        let durable_cleared = self.shared.durable.delete_all().await;
        debug!(
            "Flushed artwork cache: {} memory entries released, durable cleared: {}",
            released, durable_cleared
        );
        FlushReport {
            memory_entries_released: released,
            durable_cleared,
        }
    }

    /// Tear down the in-process state.  The durable tier is kept for the next session.
    pub fn dispose(&self) {
        let released = self.forget_session();
        debug!("Disposed artwork cache, {} memory entries released", released);
    }

    fn forget_session(&self) -> usize {
        let released = self.shared.dedup.invalidate();
        self.shared.scheduler.clear();
        self.shared.fully_loaded.lock().clear();
        released
    }

    pub(crate) fn mark_fully_loaded(&self, path: &str) {
        self.shared.fully_loaded.lock().insert(path.to_string());
    }

    pub(crate) fn was_fully_loaded(&self, path: &str) -> bool {
        self.shared.fully_loaded.lock().contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_support::*;

    #[tokio::test]
    async fn basic_ops() {
        let fetcher = CountingFetcher::new();
        let (store, cache) = build_cache(fetcher.clone());
        let k = key(&cache, "/abc.jpg", "w342");

        assert!(cache.cached(&k).is_none());
        assert!(!cache.is_cached(&k).await);

        let h = cache.resolve(&k).await.expect("Should resolve");
        assert!(cache.cached(&k).unwrap().ptr_eq(&h));
        assert!(cache.is_cached(&k).await);
        assert_eq!(store.len("test-images-v1"), 1);

        let lease = cache.acquire(&k).await.unwrap();
        assert_eq!(
            cache.stats(),
            CacheStats {
                memory_entries: 1,
                referenced_entries: 1,
                pending_requests: 0,
                prefetched_keys: 0,
                fully_loaded_paths: 0,
            }
        );
        drop(lease);
        assert_eq!(cache.stats().referenced_entries, 0);
        assert_eq!(fetcher.total(), 1);
    }

    #[tokio::test]
    async fn test_clear_all_is_complete() {
        let fetcher = CountingFetcher::new();
        let (store, cache) = build_cache(fetcher.clone());
        let ks = (0..4)
            .map(|i| key(&cache, &format!("/{}.jpg", i), "w342"))
            .collect::<Vec<_>>();

        cache.scheduler().prefetch_priority(ks.clone()).wait().await;
        let held = cache.acquire(&ks[0]).await.unwrap();
        cache.mark_fully_loaded("/0.jpg");
        assert_eq!(store.len("test-images-v1"), 4);
        assert_eq!(fetcher.total(), 4);

        let report = cache.clear_all().await;
        assert_eq!(
            report,
            FlushReport {
                memory_entries_released: 4,
                durable_cleared: true,
            }
        );
        assert!(held.handle().is_revoked());
        assert!(cache.memory().lock().is_empty());
        assert_eq!(store.len("test-images-v1"), 0);
        assert_eq!(cache.stats(), CacheStats::default());

        // Everything is a miss again.
        cache.resolve(&ks[1]).await.unwrap();
        assert_eq!(fetcher.calls(ks[1].as_str()), 2);
        assert_eq!(cache.scheduler().prefetch_priority(ks.clone()).submitted(), 4);
    }

    #[tokio::test]
    async fn test_clear_all_survives_store_failure() {
        init_logging();
        let fetcher = CountingFetcher::new();
        let cache = ArtworkCache::new(test_config(), Arc::new(FailingStore), fetcher.clone());
        let k = key(&cache, "/abc.jpg", "w342");

        assert!(cache.resolve(&k).await.is_some());
        let report = cache.clear_all().await;
        assert_eq!(report.memory_entries_released, 1);
        assert!(!report.durable_cleared);
        assert!(cache.memory().lock().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_keeps_durable_tier() {
        let fetcher = CountingFetcher::new();
        let (store, cache) = build_cache(fetcher.clone());
        let k = key(&cache, "/abc.jpg", "w342");

        cache.resolve(&k).await.unwrap();
        cache.dispose();
        assert!(cache.memory().lock().is_empty());
        assert_eq!(store.len("test-images-v1"), 1);

        // Comes back from the durable tier, not the network.
        cache.resolve(&k).await.unwrap();
        assert_eq!(fetcher.total(), 1);
    }

    #[tokio::test]
    async fn test_memory_only_configuration() {
        init_logging();
        let fetcher = CountingFetcher::new();
        let store = Arc::new(MemoryStore::new());
        let mut config = test_config();
        config.durable_enabled = false;
        let cache = ArtworkCache::new(config, store.clone(), fetcher.clone());
        let k = key(&cache, "/abc.jpg", "w342");

        cache.resolve(&k).await.unwrap();
        assert_eq!(store.len("test-images-v1"), 0);
        assert!(cache.clear_all().await.durable_cleared);
    }

    #[tokio::test]
    async fn test_zero_sized_memory_tier_stays_bounded() {
        init_logging();
        let fetcher = CountingFetcher::new();
        let mut config = test_config();
        config.memory_capacity = 0;
        config.eviction_batch = 0;
        let cache = ArtworkCache::new(config, Arc::new(MemoryStore::new()), fetcher.clone());

        for i in 0..3 {
            let k = key(&cache, &format!("/{}.jpg", i), "w342");
            assert!(cache.resolve(&k).await.is_some());
        }
        assert_eq!(cache.memory().lock().len(), 1);
        assert_eq!(fetcher.total(), 3);
    }
}
