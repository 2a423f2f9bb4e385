//! A two-tier cache for catalog artwork: posters, backdrops and their thumbnails.
//!
//! Artwork is fetched by URL, is the same for every user, and gets displayed over and over as people scroll back and
//! forth through listings.  Fetching it again every time is slow and wasteful, but simply keeping everything forever
//! grows without bound.  This crate sits between the views which display artwork and the network:
//!
//! - [MemoryCache] holds a bounded number of decoded-ready objects, reference counted by the views displaying them.
//!   When it fills up, the oldest entries nobody is displaying go first.
//! - [DurableCache] persists the raw bytes into a versioned namespace of a [DurableStore] so that they survive a
//!   restart.  [FilesystemStore] and [MemoryStore] are provided.
//! - [Deduplicator] makes sure there is only ever one fetch in flight per image, however many views ask for it.
//! - [PrefetchScheduler] warms the cache ahead of the user without competing with what is on screen.
//! - [InvalidationController] flushes everything when the user signs out.
//! - [ImageView] is the per-image state machine a UI renders from: a placeholder, then a thumbnail, then the final
//!   image.
//!
//! Every failure inside degrades to "not cached": the worst a broken store or network does is make the caller use the
//! direct URL.
//!
//! To use this crate, pick a [DurableStore], implement [Fetcher] (or enable the `http` feature for [HttpFetcher]),
//! then construct an [ArtworkCache] with your chosen [ArtworkCacheConfig].
mod artwork_cache;
mod config;
mod dedup;
mod display;
mod durable;
mod error;
mod filesystem_store;
mod handle;
#[cfg(feature = "http")]
mod http;
mod invalidation;
mod key;
mod memory;
mod prefetch;
mod traits;

#[cfg(test)]
mod test_support;

pub use artwork_cache::*;
pub use config::*;
pub use dedup::*;
pub use display::*;
pub use durable::*;
pub use error::*;
pub use filesystem_store::*;
pub use handle::*;
#[cfg(feature = "http")]
pub use http::*;
pub use invalidation::*;
pub use key::*;
pub use memory::*;
pub use prefetch::*;
pub use traits::*;
