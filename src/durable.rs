//! The durable tier.
//!
//! [DurableCache] is the only thing in this crate that talks to a [DurableStore].  It pins one namespace, refuses to
//! persist URLs outside the configured origin, and turns every store failure into a logged miss: an unavailable store,
//! a full disk or a rejected key all look like "not cached" to the rest of the crate.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{trace, warn};
use parking_lot::RwLock;

use crate::*;

#[derive(Clone)]
pub struct DurableCache {
    /// `None` when the durable tier is switched off.
    store: Option<Arc<dyn DurableStore>>,
    namespace: Arc<str>,
    keys: KeyBuilder,
}

impl DurableCache {
    pub fn new(store: Arc<dyn DurableStore>, namespace: &str, keys: KeyBuilder) -> DurableCache {
        DurableCache {
            store: Some(store),
            namespace: namespace.into(),
            keys,
        }
    }

    /// A durable tier which never hits and never stores anything.
    pub fn disabled(namespace: &str, keys: KeyBuilder) -> DurableCache {
        DurableCache {
            store: None,
            namespace: namespace.into(),
            keys,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub async fn get(&self, key: &ResourceKey) -> Option<Vec<u8>> {
        let store = self.store.as_ref()?;
        match store.get(&self.namespace, key.as_str()).await {
            Ok(x) => x,
            Err(e) => {
                warn!("Durable cache read of {} failed: {}", key, e);
                None
            }
        }
    }

    pub async fn contains(&self, key: &ResourceKey) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        store
            .contains(&self.namespace, key.as_str())
            .await
            .unwrap_or_else(|e| {
                warn!("Durable cache lookup of {} failed: {}", key, e);
                false
            })
    }

    /// Persist `bytes` unless they're already there.  Best effort.
    pub async fn put(&self, key: &ResourceKey, bytes: &[u8]) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if !self.keys.is_cacheable_url(key.as_str()) {
            trace!("Not persisting {}: outside the cache origin", key);
            return;
        }

        if self.contains(key).await {
            return;
        }

        if let Err(e) = store.put(&self.namespace, key.as_str(), bytes).await {
            warn!("Durable cache write of {} failed: {}", key, e);
        }
    }

    /// Delete everything in our namespace.  Returns false if the store reported a failure.
    pub async fn delete_all(&self) -> bool {
        let Some(store) = self.store.as_ref() else {
            return true;
        };
        match store.delete_namespace(&self.namespace).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Deleting durable namespace {} failed: {}", self.namespace, e);
                false
            }
        }
    }
}

type Namespace = HashMap<String, Arc<[u8]>, ahash::RandomState>;

/// A [DurableStore] that lives as long as the process does.
///
/// Useful where there is nothing better to persist into, and for tests.
#[derive(Default)]
pub struct MemoryStore {
    namespaces: RwLock<HashMap<String, Namespace, ahash::RandomState>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        Default::default()
    }

    /// Number of entries in a namespace.
    pub fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .get(namespace)
            .map(|x| x.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .and_then(|x| x.get(key))
            .map(|x| x.to_vec()))
    }

    async fn contains(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .is_some_and(|x| x.contains_key(key)))
    }

    async fn put(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.namespaces
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), bytes.into());
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<bool, StoreError> {
        Ok(self.namespaces.write().remove(namespace).is_some())
    }
}
