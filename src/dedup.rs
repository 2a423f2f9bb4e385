//! The [Deduplicator] makes sure there is at most one resolution in flight per key.
//!
//! Resolving a key goes memory tier, then pending table, then durable tier, then network.  The first caller to miss
//! both the memory tier and the pending table spawns the resolution and parks a shared future for it in the pending
//! table; everyone after that awaits the same future and sees the same outcome.  The spawned task removes its own
//! pending entry when it settles, success or failure, so a failed key can be retried by the next caller.
//!
//! Resolutions run as their own tasks, so a fetch keeps going and still fills the caches if every caller loses
//! interest in it.
//!
//! Failures never escape: a network failure resolves to `None` and the caller falls back to the raw URL.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::RandomState;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::*;

type Resolution = Shared<BoxFuture<'static, Option<ObjectHandle>>>;

struct PendingRequest {
    /// Tells a settling task whether the entry is still its own.
    id: u64,
    resolution: Resolution,
}

#[derive(Default)]
struct PendingTable {
    requests: HashMap<ResourceKey, PendingRequest, RandomState>,
    next_id: u64,
}

/// Removes a pending entry when its resolution task finishes, panics, or is dropped unrun.
struct SettleGuard {
    pending: Arc<Mutex<PendingTable>>,
    key: ResourceKey,
    id: u64,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if pending.requests.get(&self.key).map(|x| x.id) == Some(self.id) {
            pending.requests.remove(&self.key);
        }
    }
}

#[derive(Clone)]
pub struct Deduplicator {
    memory: Arc<Mutex<MemoryCache>>,
    durable: DurableCache,
    fetcher: Arc<dyn Fetcher>,
    pending: Arc<Mutex<PendingTable>>,
    /// Bumped by every flush.  Resolutions started under an older epoch don't write into the caches.
    epoch: Arc<AtomicU64>,
}

impl Deduplicator {
    pub fn new(
        memory: Arc<Mutex<MemoryCache>>,
        durable: DurableCache,
        fetcher: Arc<dyn Fetcher>,
    ) -> Deduplicator {
        Deduplicator {
            memory,
            durable,
            fetcher,
            pending: Default::default(),
            epoch: Default::default(),
        }
    }

    /// Resolve a key to a handle registered in the memory tier, without displaying it.
    pub async fn resolve(&self, key: &ResourceKey) -> Option<ObjectHandle> {
        let cached = self.memory.lock().get(key);
        if let Some(x) = cached {
            return Some(x);
        }

        self.pending_or_start(key).await
    }

    /// Resolve a key and start displaying it.  The returned [Lease] stops displaying it when dropped.
    pub async fn acquire(&self, key: &ResourceKey) -> Option<Lease> {
        // The handle can be evicted between the resolution settling and us getting to it, in which case it has been
        // revoked and we go around once more.
        for _ in 0..2 {
            if let Some(x) = self.acquire_cached(key) {
                return Some(x);
            }

            let handle = self.pending_or_start(key).await?;
            let acquired = {
                let mut memory = self.memory.lock();
                if memory.contains(key) {
                    memory.acquire_existing(key)
                } else if !handle.is_revoked() {
                    Some(memory.acquire(key.clone(), handle))
                } else {
                    None
                }
            };
            if let Some(x) = acquired {
                return Some(self.lease(key, x));
            }

            debug!("{} was evicted before it could be displayed, resolving again", key);
        }

        None
    }

    /// Start displaying a key only if the memory tier already has it.  Never suspends.
    pub fn acquire_cached(&self, key: &ResourceKey) -> Option<Lease> {
        let existing = self.memory.lock().acquire_existing(key);
        existing.map(|x| self.lease(key, x))
    }

    pub fn is_pending(&self, key: &ResourceKey) -> bool {
        self.pending.lock().requests.contains_key(key)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().requests.len()
    }

    /// Release every memory entry and forget every pending resolution.
    ///
    /// Returns how many memory entries were dropped.
    pub(crate) fn invalidate(&self) -> usize {
        let released = {
            let mut memory = self.memory.lock();
            self.epoch.fetch_add(1, Ordering::AcqRel);
            memory.clear()
        };
        let forgotten = {
            let mut pending = self.pending.lock();
            let n = pending.requests.len();
            pending.requests.clear();
            n
        };
        debug!(
            "Released {} memory entries, forgot {} pending resolutions",
            released, forgotten
        );
        released
    }

    fn lease(&self, key: &ResourceKey, handle: ObjectHandle) -> Lease {
        Lease {
            key: key.clone(),
            handle,
            memory: Arc::downgrade(&self.memory),
        }
    }

    /// Join the pending resolution for `key`, or start one.
    fn pending_or_start(&self, key: &ResourceKey) -> Resolution {
        let (guard, epoch, tx, resolution) = {
            let mut pending = self.pending.lock();
            if let Some(x) = pending.requests.get(key) {
                trace!("Joining pending resolution of {}", key);
                return x.resolution.clone();
            }

            // A resolution may have finished between the caller's memory check and taking the lock.
            let cached = self.memory.lock().get(key);
            if let Some(x) = cached {
                return futures::future::ready(Some(x)).boxed().shared();
            }

            pending.next_id += 1;
            let id = pending.next_id;
            let (tx, rx) = oneshot::channel();
            let resolution = async move {
                rx.await.unwrap_or_else(|_| {
                    warn!("Resolution task ended without settling");
                    None
                })
            }
            .boxed()
            .shared();
            pending.requests.insert(
                key.clone(),
                PendingRequest {
                    id,
                    resolution: resolution.clone(),
                },
            );

            let guard = SettleGuard {
                pending: self.pending.clone(),
                key: key.clone(),
                id,
            };
            (guard, self.epoch.load(Ordering::Acquire), tx, resolution)
        };

        // Spawning can drop the task on the spot, guard included, so the pending lock must be released by now.
        let this = self.clone();
        let task_key = key.clone();
        tokio::spawn(async move {
            let result = this.load(&task_key, epoch).await;
            drop(guard);
            let _ = tx.send(result);
        });
        resolution
    }

    /// Durable tier, then network.
    async fn load(&self, key: &ResourceKey, epoch: u64) -> Option<ObjectHandle> {
        if let Some(bytes) = self.durable.get(key).await {
            trace!("Durable hit for {}", key);
            return Some(self.register(key, ObjectHandle::new(key.clone(), bytes), epoch));
        }

        let bytes: Arc<[u8]> = match self.fetcher.fetch(key.as_str()).await {
            Ok(x) => x.into(),
            Err(e) => {
                debug!("Fetching {} failed: {}", key, e);
                return None;
            }
        };

        let handle = self.register(key, ObjectHandle::new(key.clone(), bytes.clone()), epoch);
        if self.epoch.load(Ordering::Acquire) == epoch {
            self.durable.put(key, &bytes).await;
        }
        Some(handle)
    }

    fn register(&self, key: &ResourceKey, handle: ObjectHandle, epoch: u64) -> ObjectHandle {
        let mut memory = self.memory.lock();
        if self.epoch.load(Ordering::Acquire) != epoch {
            trace!("Not caching {}: the cache was flushed while it loaded", key);
            return handle;
        }
        memory.register(key.clone(), handle)
    }
}

/// Proof that somebody is displaying a cached entry.
///
/// Dropping the lease decrements the entry's reference count, so the bracket is closed on every exit path.  A lease
/// which outlives a flush does nothing when dropped.
pub struct Lease {
    key: ResourceKey,
    handle: ObjectHandle,
    memory: Weak<Mutex<MemoryCache>>,
}

impl Lease {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("handle", &self.handle.id())
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.upgrade() {
            memory.lock().release_handle(&self.key, &self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_support::*;

    const NS: &str = "test-images-v1";

    struct Fixture {
        memory: Arc<Mutex<MemoryCache>>,
        store: Arc<MemoryStore>,
        fetcher: Arc<CountingFetcher>,
        dedup: Deduplicator,
    }

    fn fixture_with(fetcher: Arc<CountingFetcher>, store: Arc<dyn DurableStore>) -> Deduplicator {
        init_logging();
        let memory = Arc::new(Mutex::new(MemoryCache::new(80, 20)));
        let durable = DurableCache::new(store, NS, KeyBuilder::new(ORIGIN));
        Deduplicator::new(memory, durable, fetcher)
    }

    fn fixture(fetcher: Arc<CountingFetcher>) -> Fixture {
        init_logging();
        let memory = Arc::new(Mutex::new(MemoryCache::new(80, 20)));
        let store = Arc::new(MemoryStore::new());
        let durable = DurableCache::new(store.clone(), NS, KeyBuilder::new(ORIGIN));
        let dedup = Deduplicator::new(memory.clone(), durable, fetcher.clone());
        Fixture {
            memory,
            store,
            fetcher,
            dedup,
        }
    }

    fn key(path: &str) -> ResourceKey {
        KeyBuilder::new(ORIGIN).build_key(path, "w342").unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_fetch() {
        let (fetcher, gate) = CountingFetcher::gated();
        let fx = fixture(fetcher);
        let k = key("/abc.jpg");

        let waiters = futures::future::join_all((0..10).map(|_| fx.dedup.resolve(&k)));
        let opener = async {
            tokio::task::yield_now().await;
            assert_eq!(fx.dedup.pending_len(), 1);
            gate.send(true).unwrap();
        };
        let (results, _) = tokio::join!(waiters, opener);

        assert_eq!(fx.fetcher.calls(k.as_str()), 1);
        let first = results[0].clone().expect("Should resolve");
        assert!(results.iter().all(|x| x.as_ref().unwrap().ptr_eq(&first)));
        assert_eq!(first.bytes(), Some(k.as_str().as_bytes()));
        assert_eq!(fx.dedup.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_network_result_lands_in_both_tiers() {
        let fx = fixture(CountingFetcher::new());
        let k = key("/abc.jpg");

        let h = fx.dedup.resolve(&k).await.unwrap();
        assert_eq!(fx.memory.lock().ref_count(&k), Some(0));
        assert_eq!(fx.store.len(NS), 1);

        // Memory hit: no I/O at all.
        assert!(fx.dedup.resolve(&k).await.unwrap().ptr_eq(&h));
        assert_eq!(fx.fetcher.total(), 1);
    }

    #[tokio::test]
    async fn test_durable_hit_skips_network() {
        let fx = fixture(CountingFetcher::new());
        let k = key("/abc.jpg");
        fx.store.put(NS, k.as_str(), b"stored").await.unwrap();

        let h = fx.dedup.resolve(&k).await.unwrap();
        assert_eq!(h.bytes(), Some(&b"stored"[..]));
        assert_eq!(fx.fetcher.total(), 0);
        assert!(fx.memory.lock().contains(&k));
    }

    #[tokio::test]
    async fn test_failures_settle_and_retry() {
        let fx = fixture(CountingFetcher::new());
        let k = key("/missing.jpg");
        fx.fetcher.fail(k.as_str());

        assert!(fx.dedup.resolve(&k).await.is_none());
        assert!(!fx.dedup.is_pending(&k));
        assert!(!fx.memory.lock().contains(&k));
        assert_eq!(fx.store.len(NS), 0);

        assert!(fx.dedup.resolve(&k).await.is_none());
        assert_eq!(fx.fetcher.calls(k.as_str()), 2);
    }

    #[tokio::test]
    async fn test_durable_failures_are_not_fatal() {
        let fetcher = CountingFetcher::new();
        let dedup = fixture_with(fetcher.clone(), Arc::new(FailingStore));
        let k = key("/abc.jpg");

        let h = dedup.resolve(&k).await.expect("Should fall through to the network");
        assert_eq!(h.bytes(), Some(k.as_str().as_bytes()));
        assert_eq!(fetcher.calls(k.as_str()), 1);
    }

    #[tokio::test]
    async fn test_leases_bracket_ref_counts() {
        let fx = fixture(CountingFetcher::new());
        let k = key("/abc.jpg");

        let a = fx.dedup.acquire(&k).await.unwrap();
        let b = fx.dedup.acquire(&k).await.unwrap();
        assert!(a.handle().ptr_eq(b.handle()));
        assert_eq!(fx.memory.lock().ref_count(&k), Some(2));

        drop(a);
        assert_eq!(fx.memory.lock().ref_count(&k), Some(1));
        drop(b);
        assert_eq!(fx.memory.lock().ref_count(&k), Some(0));
        assert_eq!(fx.fetcher.total(), 1);
    }

    #[tokio::test]
    async fn test_lease_outliving_flush_is_harmless() {
        let fx = fixture(CountingFetcher::new());
        let k = key("/abc.jpg");

        let stale = fx.dedup.acquire(&k).await.unwrap();
        fx.dedup.invalidate();
        assert!(stale.handle().is_revoked());

        let fresh = fx.dedup.acquire(&k).await.unwrap();
        assert!(!fresh.handle().is_revoked());
        drop(stale);
        assert_eq!(fx.memory.lock().ref_count(&k), Some(1));
        drop(fresh);
    }

    #[tokio::test]
    async fn test_flush_during_flight_caches_nothing() {
        let (fetcher, gate) = CountingFetcher::gated();
        let fx = fixture(fetcher);
        let k = key("/abc.jpg");

        let waiter = tokio::spawn({
            let dedup = fx.dedup.clone();
            let k = k.clone();
            async move { dedup.resolve(&k).await }
        });
        while fx.fetcher.total() == 0 {
            tokio::task::yield_now().await;
        }

        fx.dedup.invalidate();
        assert_eq!(fx.dedup.pending_len(), 0);
        gate.send(true).unwrap();

        let h = waiter.await.unwrap().expect("Waiters still get their result");
        assert!(!h.is_revoked());
        assert!(!fx.memory.lock().contains(&k));
        assert_eq!(fx.store.len(NS), 0);
    }

    #[test]
    fn test_resolve_on_stopped_runtime_settles() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let handle = rt.handle().clone();
        drop(rt);

        let _entered = handle.enter();
        let fx = fixture(CountingFetcher::new());
        let k = key("/abc.jpg");
        assert!(futures::executor::block_on(fx.dedup.resolve(&k)).is_none());
        assert_eq!(fx.dedup.pending_len(), 0);
        assert_eq!(fx.fetcher.total(), 0);

        // A later caller tries again instead of joining a dead entry.
        assert!(futures::executor::block_on(fx.dedup.resolve(&k)).is_none());
        assert_eq!(fx.dedup.pending_len(), 0);
    }
}
