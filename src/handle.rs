//! Displayable object handles.
//!
//! An [ObjectHandle] is the in-process stand-in for a decoded image: cheap to clone, dereferenceable to the image bytes
//! for as long as it is live.  Releasing a handle revokes it for every clone at once, the same way an object URL stops
//! resolving once it has been revoked.  Anything still holding a revoked handle sees `None` from [ObjectHandle::bytes]
//! and is expected to fall back to the raw network source.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::ResourceKey;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

struct HandleInner {
    id: u64,
    key: ResourceKey,
    bytes: Arc<[u8]>,
    revoked: AtomicBool,
}

#[derive(Clone)]
pub struct ObjectHandle {
    inner: Arc<HandleInner>,
}

impl ObjectHandle {
    pub fn new(key: ResourceKey, bytes: impl Into<Arc<[u8]>>) -> ObjectHandle {
        ObjectHandle {
            inner: Arc::new(HandleInner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                key,
                bytes: bytes.into(),
                revoked: AtomicBool::new(false),
            }),
        }
    }

    /// Process-unique id of the underlying object.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn key(&self) -> &ResourceKey {
        &self.inner.key
    }

    /// The image bytes, or `None` once the handle has been revoked.
    pub fn bytes(&self) -> Option<&[u8]> {
        if self.is_revoked() {
            None
        } else {
            Some(&self.inner.bytes)
        }
    }

    pub fn len(&self) -> usize {
        self.inner.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.bytes.is_empty()
    }

    pub fn is_revoked(&self) -> bool {
        self.inner.revoked.load(Ordering::Acquire)
    }

    /// Do both handles refer to the same object?
    pub fn ptr_eq(&self, other: &ObjectHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn revoke(&self) {
        self.inner.revoked.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("len", &self.inner.bytes.len())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &ObjectHandle) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ObjectHandle {}
