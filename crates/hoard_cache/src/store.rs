//! Storage port consumed by the cache orchestrator.
//!
//! Backends only keep entries; every policy decision is made before `put`.

mod disk;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{entry::CacheEntry, key::CacheKey};

pub use disk::DiskStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry could not be encoded: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cache entry is corrupt: {0}")]
    Corrupt(String),
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

/// Key/value capability backing the cache. Must be safe for concurrent use.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live entry. Expired entries are reported as absent.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;

    /// Store `entry`, fully replacing any previous one for `key`.
    /// The entry must not be visible to readers until completely written.
    async fn put(&self, key: CacheKey, entry: CacheEntry, ttl: Duration) -> Result<(), StoreError>;

    async fn purge(&self, key: &CacheKey) -> Result<(), StoreError>;
}
