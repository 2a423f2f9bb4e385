//! The seams between this crate and the outside world.
//!
//! A [DurableStore] persists response bytes under their URL in a named namespace, and a [Fetcher] goes to the network.
//! The cache layers everything else on top: it never assumes either one is reliable.
use async_trait::async_trait;

use crate::{FetchError, StoreError};

/// An origin-scoped, persistent key to bytes store, split into named namespaces.
///
/// Namespaces are versioned by the caller, so that changing how things are cached never reads entries written under
/// an older scheme.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Read the bytes stored under `key`, if any.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn contains(&self, namespace: &str, key: &str) -> Result<bool, StoreError>;

    /// Store `bytes` under `key`, replacing anything already there.
    ///
    /// Concurrent puts of the same key must leave one complete value behind.
    async fn put(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Delete a whole namespace, returning whether it existed.
    async fn delete_namespace(&self, namespace: &str) -> Result<bool, StoreError>;
}

/// Fetches the bytes behind a URL from the network.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}
