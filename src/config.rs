use std::time::Duration;

use relative_path::{Component, RelativePath};

/// Everything tunable about an [ArtworkCache](crate::ArtworkCache).
///
/// Every field has a default, so `ArtworkCacheConfigBuilder::default().build()` gives the stock configuration.
#[derive(Clone, Debug, derive_builder::Builder)]
#[builder(default, build_fn(validate = "Self::validate"))]
pub struct ArtworkCacheConfig {
    /// Prefix of every canonical key, e.g. `https://image.tmdb.org/t/p`.
    #[builder(setter(into))]
    pub origin: String,
    /// Durable namespace.  Bump the version suffix whenever the caching scheme changes.
    #[builder(setter(into))]
    pub namespace: String,
    /// Tier used for low-resolution previews.
    #[builder(setter(into))]
    pub thumbnail_tier: String,
    /// Final tier when a view doesn't say how wide it is.
    #[builder(setter(into))]
    pub default_tier: String,
    /// Size of the memory tier at which inserting starts evicting.
    pub memory_capacity: usize,
    /// Most entries dropped by one eviction pass.
    pub eviction_batch: usize,
    /// Concurrent fetches per standard-tier prefetch batch.
    pub standard_batch_size: usize,
    /// Concurrent fetches per low-tier prefetch batch.
    pub low_batch_size: usize,
    /// Longest a standard-tier prefetch waits for an idle signal.
    pub standard_idle_ceiling: Duration,
    /// Longest a low-tier prefetch waits for an idle signal.
    pub low_idle_ceiling: Duration,
    /// Standard-tier deferral when idle scheduling is off.
    pub standard_fallback_delay: Duration,
    /// Low-tier deferral when idle scheduling is off.
    pub low_fallback_delay: Duration,
    /// Whether the host will call [ArtworkCache::notify_idle](crate::ArtworkCache::notify_idle).
    pub idle_scheduling: bool,
    /// Turn off to keep everything in memory only.
    pub durable_enabled: bool,
}

impl Default for ArtworkCacheConfig {
    fn default() -> Self {
        ArtworkCacheConfig {
            origin: "https://image.tmdb.org/t/p".to_string(),
            namespace: "artwork-images-v3".to_string(),
            thumbnail_tier: "w92".to_string(),
            default_tier: "w342".to_string(),
            memory_capacity: 80,
            eviction_batch: 20,
            standard_batch_size: 6,
            low_batch_size: 3,
            standard_idle_ceiling: Duration::from_millis(2000),
            low_idle_ceiling: Duration::from_millis(3000),
            standard_fallback_delay: Duration::from_millis(100),
            low_fallback_delay: Duration::from_millis(200),
            idle_scheduling: true,
            durable_enabled: true,
        }
    }
}

impl ArtworkCacheConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("memory_capacity", self.memory_capacity),
            ("eviction_batch", self.eviction_batch),
            ("standard_batch_size", self.standard_batch_size),
            ("low_batch_size", self.low_batch_size),
        ] {
            if value == Some(0) {
                return Err(format!("{} must be at least 1", name));
            }
        }

        if matches!(&self.origin, Some(x) if x.trim_end_matches('/').is_empty()) {
            return Err("origin must not be empty".to_string());
        }

        if let Some(ns) = &self.namespace {
            let mut components = RelativePath::new(ns).components();
            let single = matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(x)), None) if x == ns
            );
            if !single {
                return Err(format!("namespace {:?} must be a single path segment", ns));
            }
        }

        for tier in [&self.thumbnail_tier, &self.default_tier].into_iter().flatten() {
            if tier.is_empty() || !tier.bytes().all(|b| b.is_ascii_alphanumeric()) {
                return Err(format!("{:?} is not a size tier", tier));
            }
        }

        Ok(())
    }
}
