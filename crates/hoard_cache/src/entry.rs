use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// Immutable snapshot of an origin response.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub stored_at: SystemTime,
    pub expires_at: SystemTime,
}

impl CacheEntry {
    /// Snapshot a response now, expiring after `ttl`.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes, ttl: Duration) -> Self {
        let stored_at = SystemTime::now();
        Self {
            status,
            headers,
            body,
            stored_at,
            expires_at: stored_at + ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.expires_at
            .duration_since(self.stored_at)
            .unwrap_or_default()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}
