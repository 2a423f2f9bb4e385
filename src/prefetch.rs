//! Warming the cache ahead of the user.
//!
//! Prefetches come in three tiers.  [PrefetchTier::Priority] work (hero art, anything above the fold) starts as soon
//! as it is submitted.  [PrefetchTier::Standard] and [PrefetchTier::Low] work waits for the host to report an idle
//! moment, or for the tier's ceiling to pass if it never does, and then runs in small batches: a batch finishes when
//! every fetch in it has settled, and a failed fetch never takes the rest of its batch down with it.
//!
//! Every key is remembered for the rest of the session once submitted, so resubmitting it (a re-render, say) does
//! nothing.  A deferred job can be cancelled up until it starts; after that its fetches run to completion, since the
//! result is still worth caching.  Forgetting the session stops every outstanding job before its next batch.
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use log::{debug, trace};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::*;

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrefetchTier {
    /// Resolve immediately, all at once.
    Priority,
    /// Defer to an idle window, then batch.
    Standard,
    /// Like standard, with a longer ceiling and smaller batches.  For imagery that isn't on screen.
    Low,
}

/// What happened to a prefetch job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    /// Keys the job took on, after dropping already-requested ones.
    pub submitted: usize,
    pub resolved: usize,
    pub failed: usize,
    /// The job was cancelled before it started, or the session was forgotten before it got through every batch.
    pub cancelled: bool,
}

/// Handle to one submitted prefetch job.
///
/// Dropping the ticket detaches the job; it still runs.
#[derive(Debug)]
pub struct PrefetchTicket {
    tier: PrefetchTier,
    submitted: usize,
    cancel: Option<oneshot::Sender<()>>,
    /// One of `PENDING`, `STARTED` or `CANCELLED`.  Only ever moves away from `PENDING`, once.
    phase: Arc<AtomicU8>,
    task: Option<JoinHandle<PrefetchReport>>,
}

impl PrefetchTicket {
    fn empty(tier: PrefetchTier) -> PrefetchTicket {
        PrefetchTicket {
            tier,
            submitted: 0,
            cancel: None,
            phase: Arc::new(AtomicU8::new(STARTED)),
            task: None,
        }
    }

    pub fn tier(&self) -> PrefetchTier {
        self.tier
    }

    /// Keys the job took on.
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    pub fn has_started(&self) -> bool {
        self.phase.load(Ordering::Acquire) == STARTED
    }

    /// Cancel the job if it is still waiting for its slot.
    ///
    /// Returns false if the job had already started, in which case it runs to completion.  Keys of a cancelled job
    /// may be prefetched again later.
    pub fn cancel(&mut self) -> bool {
        if self
            .phase
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Wake the job so it stops waiting.  If it already woke it sees the phase and gives up anyway.
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        true
    }

    /// Wait for the job to finish.
    pub async fn wait(mut self) -> PrefetchReport {
        let Some(task) = self.task.take() else {
            return PrefetchReport::default();
        };
        // Keep the cancel channel open while waiting, or the job would read it as a detach.
        let _cancel = self.cancel.take();
        task.await.unwrap_or_else(|e| {
            debug!("Prefetch job failed: {}", e);
            PrefetchReport {
                submitted: self.submitted,
                ..Default::default()
            }
        })
    }
}

#[derive(Clone, Debug)]
struct TierTiming {
    standard_batch: usize,
    low_batch: usize,
    standard_ceiling: Duration,
    low_ceiling: Duration,
    standard_fallback: Duration,
    low_fallback: Duration,
    idle_scheduling: bool,
}

#[derive(Clone)]
pub struct PrefetchScheduler {
    dedup: Deduplicator,
    keys: KeyBuilder,
    thumbnail_tier: Arc<str>,
    /// Every key submitted this session.
    requested: Arc<Mutex<HashSet<ResourceKey, RandomState>>>,
    /// Page numbers handed to [PrefetchScheduler::prefetch_page] this session.
    pages: Arc<Mutex<HashSet<u32, RandomState>>>,
    /// Counts idle signals.  Jobs subscribe when submitted, so a signal sent before they first poll still counts.
    idle: Arc<watch::Sender<u64>>,
    /// Bumped whenever the session is forgotten.  Jobs from an older session stop before their next batch.
    session: Arc<AtomicU64>,
    timing: TierTiming,
}

/// What a spawned job needs besides its keys.
struct JobContext {
    tier: PrefetchTier,
    cancel_rx: oneshot::Receiver<()>,
    phase: Arc<AtomicU8>,
    idle: watch::Receiver<u64>,
    session: u64,
}

impl PrefetchScheduler {
    pub fn new(dedup: Deduplicator, keys: KeyBuilder, config: &ArtworkCacheConfig) -> PrefetchScheduler {
        PrefetchScheduler {
            dedup,
            keys,
            thumbnail_tier: config.thumbnail_tier.as_str().into(),
            requested: Default::default(),
            pages: Default::default(),
            idle: Arc::new(watch::channel(0).0),
            session: Default::default(),
            timing: TierTiming {
                standard_batch: config.standard_batch_size.max(1),
                low_batch: config.low_batch_size.max(1),
                standard_ceiling: config.standard_idle_ceiling,
                low_ceiling: config.low_idle_ceiling,
                standard_fallback: config.standard_fallback_delay,
                low_fallback: config.low_fallback_delay,
                idle_scheduling: config.idle_scheduling,
            },
        }
    }

    /// Submit keys under a tier.  Keys submitted earlier this session are skipped.
    pub fn prefetch(&self, tier: PrefetchTier, keys: impl IntoIterator<Item = ResourceKey>) -> PrefetchTicket {
        let (fresh, session) = {
            let mut requested = self.requested.lock();
            let fresh = keys.into_iter().filter(|k| requested.insert(k.clone())).collect::<Vec<_>>();
            (fresh, self.session.load(Ordering::Acquire))
        };
        if fresh.is_empty() {
            return PrefetchTicket::empty(tier);
        }

        trace!("Submitting {} keys at {:?}", fresh.len(), tier);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let initial = if tier == PrefetchTier::Priority { STARTED } else { PENDING };
        let phase = Arc::new(AtomicU8::new(initial));
        let submitted = fresh.len();
        let ctx = JobContext {
            tier,
            cancel_rx,
            phase: phase.clone(),
            idle: self.idle.subscribe(),
            session,
        };
        let task = tokio::spawn(self.clone().run(fresh, ctx));

        PrefetchTicket {
            tier,
            submitted,
            cancel: Some(cancel_tx),
            phase,
            task: Some(task),
        }
    }

    pub fn prefetch_priority(&self, keys: impl IntoIterator<Item = ResourceKey>) -> PrefetchTicket {
        self.prefetch(PrefetchTier::Priority, keys)
    }

    pub fn prefetch_standard(&self, keys: impl IntoIterator<Item = ResourceKey>) -> PrefetchTicket {
        self.prefetch(PrefetchTier::Standard, keys)
    }

    pub fn prefetch_low(&self, keys: impl IntoIterator<Item = ResourceKey>) -> PrefetchTicket {
        self.prefetch(PrefetchTier::Low, keys)
    }

    /// Warm thumbnails for a list of raw poster paths.  Uncacheable paths are skipped.
    pub fn prefetch_thumbnails<I, S>(&self, paths: I) -> PrefetchTicket
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = self.keys_for(paths, &self.thumbnail_tier);
        self.prefetch_standard(keys)
    }

    /// Warm backdrops at `tier`, at low priority.
    pub fn prefetch_backdrops<I, S>(&self, paths: I, tier: &str) -> PrefetchTicket
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = self.keys_for(paths, tier);
        self.prefetch_low(keys)
    }

    /// Warm the thumbnails of one page of a paged listing.  Each page number is only ever prefetched once.
    pub fn prefetch_page<I, S>(&self, paths: I, page: u32) -> PrefetchTicket
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.pages.lock().insert(page) {
            return PrefetchTicket::empty(PrefetchTier::Standard);
        }
        self.prefetch_thumbnails(paths)
    }

    /// Tell deferred jobs that now is a good time to run.
    pub fn notify_idle(&self) {
        self.idle.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub fn is_requested(&self, key: &ResourceKey) -> bool {
        self.requested.lock().contains(key)
    }

    pub fn requested_len(&self) -> usize {
        self.requested.lock().len()
    }

    /// Forget everything submitted this session, and stop the jobs it submitted.
    pub(crate) fn clear(&self) {
        let mut requested = self.requested.lock();
        self.session.fetch_add(1, Ordering::AcqRel);
        requested.clear();
        self.pages.lock().clear();
    }

    fn is_stale(&self, session: u64) -> bool {
        self.session.load(Ordering::Acquire) != session
    }

    fn keys_for<I, S>(&self, paths: I, tier: &str) -> Vec<ResourceKey>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        paths
            .into_iter()
            .filter_map(|p| {
                let path = self.keys.path_from_source(p.as_ref())?;
                self.keys.build_key(path, tier)
            })
            .collect()
    }

    async fn run(self, keys: Vec<ResourceKey>, ctx: JobContext) -> PrefetchReport {
        let JobContext {
            tier,
            mut cancel_rx,
            phase,
            mut idle,
            session,
        } = ctx;
        let mut report = PrefetchReport {
            submitted: keys.len(),
            ..Default::default()
        };

        if tier != PrefetchTier::Priority {
            let slot = self.wait_for_slot(tier, &mut idle);
            tokio::pin!(slot);
            tokio::select! {
                res = &mut cancel_rx => {
                    if res.is_err() {
                        // The ticket was dropped, which only detaches us.
                        (&mut slot).await;
                    }
                }
                _ = &mut slot => {}
            }

            if self.is_stale(session) {
                phase.store(CANCELLED, Ordering::Release);
                debug!("Dropping a {:?} prefetch of {} keys from a forgotten session", tier, keys.len());
                report.cancelled = true;
                return report;
            }
            if phase
                .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!("Cancelled a {:?} prefetch of {} keys", tier, keys.len());
                self.forget(&keys);
                report.cancelled = true;
                return report;
            }
        }

        let batch_size = match tier {
            PrefetchTier::Priority => keys.len().max(1),
            PrefetchTier::Standard => self.timing.standard_batch,
            PrefetchTier::Low => self.timing.low_batch,
        };

        for batch in keys.chunks(batch_size) {
            if self.is_stale(session) {
                debug!("Stopping a {:?} prefetch: the session was forgotten", tier);
                report.cancelled = true;
                break;
            }
            let results = futures::future::join_all(batch.iter().map(|k| self.dedup.resolve(k))).await;
            for r in results {
                if r.is_some() {
                    report.resolved += 1;
                } else {
                    report.failed += 1;
                }
            }
        }

        debug!(
            "{:?} prefetch done: {} resolved, {} failed",
            tier, report.resolved, report.failed
        );
        report
    }

    /// Wait for an idle signal or the tier's ceiling, whichever comes first.
    async fn wait_for_slot(&self, tier: PrefetchTier, idle: &mut watch::Receiver<u64>) {
        let (ceiling, fallback) = match tier {
            PrefetchTier::Low => (self.timing.low_ceiling, self.timing.low_fallback),
            _ => (self.timing.standard_ceiling, self.timing.standard_fallback),
        };

        if !self.timing.idle_scheduling {
            tokio::time::sleep(fallback).await;
            return;
        }

        tokio::select! {
            Ok(()) = idle.changed() => trace!("{:?} prefetch released by idle signal", tier),
            _ = tokio::time::sleep(ceiling) => trace!("{:?} prefetch released by ceiling", tier),
        }
    }

    fn forget(&self, keys: &[ResourceKey]) {
        let mut requested = self.requested.lock();
        for k in keys {
            requested.remove(k);
        }
    }
}
