//! Error types for the collaborators this crate drives.
//!
//! Neither error ever reaches a consumer of the cache: the durable adapter and the deduplicator log them and carry on
//! as if the image simply wasn't cached.
use std::io::Error as IoError;

/// Errors from a [DurableStore](crate::DurableStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("durable store I/O failed: {0}")]
    Io(#[from] IoError),
    #[error("key {0:?} can't be stored")]
    InvalidKey(String),
    #[error("namespace {0:?} is not a single path segment")]
    InvalidNamespace(String),
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from a [Fetcher](crate::Fetcher).
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("server answered {0}")]
    Status(u16),
    #[error("transport failed: {0}")]
    Transport(String),
}
