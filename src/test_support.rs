//! Fixtures shared by the tests in this crate.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::*;

pub(crate) const ORIGIN: &str = "https://img.test/t/p";

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn test_config() -> ArtworkCacheConfig {
    ArtworkCacheConfigBuilder::default()
        .origin(ORIGIN)
        .namespace("test-images-v1")
        .build()
        .expect("Should build")
}

/// Serves `url` bytes for every URL, except those marked missing, and counts calls per URL.
#[derive(Default)]
pub(crate) struct CountingFetcher {
    calls: Mutex<HashMap<String, usize>>,
    missing: Mutex<Vec<String>>,
    /// While closed, fetches wait for it to open.
    gate: Mutex<Option<watch::Receiver<bool>>>,
    /// URLs the gate applies to.  `None` means all of them.
    gated_urls: Mutex<Option<Vec<String>>>,
    total: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl CountingFetcher {
    pub(crate) fn new() -> Arc<CountingFetcher> {
        Arc::new(Default::default())
    }

    /// Make fetches block until the returned sender sends `true`.
    pub(crate) fn gated() -> (Arc<CountingFetcher>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let fetcher = CountingFetcher {
            gate: Mutex::new(Some(rx)),
            ..Default::default()
        };
        (Arc::new(fetcher), tx)
    }

    /// Like [CountingFetcher::gated], but only fetches of `urls` wait.
    pub(crate) fn gated_only(urls: &[&str]) -> (Arc<CountingFetcher>, watch::Sender<bool>) {
        let (fetcher, tx) = CountingFetcher::gated();
        *fetcher.gated_urls.lock() = Some(urls.iter().map(|x| x.to_string()).collect());
        (fetcher, tx)
    }

    pub(crate) fn fail(&self, url: &str) {
        self.missing.lock().push(url.to_string());
    }

    pub(crate) fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub(crate) fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Most fetches that were ever running at once.
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        *self.calls.lock().entry(url.to_string()).or_default() += 1;
        self.total.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        // Give every fetch of a batch the chance to start before any finishes.
        tokio::task::yield_now().await;

        let applies = self
            .gated_urls
            .lock()
            .as_ref()
            .map_or(true, |urls| urls.iter().any(|x| x == url));
        let gate = if applies { self.gate.lock().clone() } else { None };
        if let Some(mut gate) = gate {
            while !*gate.borrow_and_update() {
                if gate.changed().await.is_err() {
                    break;
                }
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.missing.lock().iter().any(|x| x == url) {
            return Err(FetchError::Status(404));
        }
        Ok(url.as_bytes().to_vec())
    }
}

/// A store where every operation fails, as when storage is blocked or over quota.
pub(crate) struct FailingStore;

#[async_trait]
impl DurableStore for FailingStore {
    async fn get(&self, _namespace: &str, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError::Unavailable("blocked".into()))
    }

    async fn contains(&self, _namespace: &str, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("blocked".into()))
    }

    async fn put(&self, _namespace: &str, _key: &str, _bytes: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("quota exceeded".into()))
    }

    async fn delete_namespace(&self, _namespace: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("blocked".into()))
    }
}

/// Build a cache over a fresh [MemoryStore].
pub(crate) fn build_cache(
    fetcher: Arc<CountingFetcher>,
) -> (Arc<MemoryStore>, ArtworkCache) {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let cache = ArtworkCache::new(test_config(), store.clone(), fetcher);
    (store, cache)
}

pub(crate) fn key(cache: &ArtworkCache, path: &str, tier: &str) -> ResourceKey {
    cache.keys().build_key(path, tier).expect("valid path")
}
