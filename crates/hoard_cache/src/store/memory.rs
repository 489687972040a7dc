use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{CacheStore, StoreError};
use crate::{entry::CacheEntry, key::CacheKey};

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    deadline: Instant,
}

/// In-process store. Expiry is checked against a monotonic deadline.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<CacheKey, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry and return how many were removed.
    pub fn remove_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, slot| slot.deadline > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(target: "hoard::store", layer = "memory", removed, "Swept expired entries");
        }
        removed
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(slot) if now < slot.deadline => return Ok(Some(slot.entry.clone())),
            Some(_) => true,
            None => false,
        };

        // The shard guard from `get` is released above; removing while
        // holding it would deadlock.
        if expired {
            self.entries.remove_if(key, |_, slot| slot.deadline <= now);
        }
        Ok(None)
    }

    async fn put(&self, key: CacheKey, entry: CacheEntry, ttl: Duration) -> Result<(), StoreError> {
        let slot = Slot {
            entry,
            deadline: Instant::now() + ttl,
        };
        self.entries.insert(key, slot);
        Ok(())
    }

    async fn purge(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}
