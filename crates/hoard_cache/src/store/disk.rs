//! Disk-backed store: one `<hash>.cache` file per key.
//!
//! File layout is a single JSON metadata line followed by the raw body.
//! Files are written under a temporary name and renamed into place, so a
//! reader sees either the previous entry or the new one, never a mix.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{
    fs,
    io::{AsyncBufReadExt, BufReader},
};
use tracing::{debug, warn};

use super::{CacheStore, StoreError};
use crate::{entry::CacheEntry, key::CacheKey};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    status: u16,
    headers: Vec<(String, Vec<u8>)>,
    stored_at_ms: u64,
    expires_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.cache", key_hash(key)))
    }

    fn tmp_path(&self, key: &CacheKey) -> PathBuf {
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!(
            "{}.{}.{}.tmp",
            key_hash(key),
            std::process::id(),
            seq
        ))
    }

    /// Delete every `*.cache` file whose metadata says it has expired.
    /// Unreadable files are left for `get` to report.
    pub async fn remove_expired(&self) -> Result<usize, StoreError> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = now_ms();
        let mut removed = 0;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().is_none_or(|ext| ext != "cache") {
                continue;
            }

            let expires_at_ms = match read_expiry(&path).await {
                Ok(Some(ms)) => ms,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        target: "hoard::store",
                        layer = "disk",
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable entry during sweep"
                    );
                    continue;
                }
            };

            if now >= expires_at_ms {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if removed > 0 {
            debug!(target: "hoard::store", layer = "disk", removed, "Swept expired entries");
        }
        Ok(removed)
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let path = self.entry_path(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (meta, body) = decode(raw)?;

        // Different key with the same hash.
        if meta.key != key.to_string() {
            return Ok(None);
        }

        if now_ms() >= meta.expires_at_ms {
            debug!(target: "hoard::store", cache_key = %key, layer = "disk", "Removing expired entry");
            let _ = fs::remove_file(&path).await;
            return Ok(None);
        }

        let mut headers = HeaderMap::with_capacity(meta.headers.len());
        for (name, value) in meta.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| StoreError::Corrupt(format!("header name '{name}': {e}")))?;
            let value = HeaderValue::from_bytes(&value)
                .map_err(|e| StoreError::Corrupt(format!("header value for '{name}': {e}")))?;
            headers.append(name, value);
        }

        let status = StatusCode::from_u16(meta.status)
            .map_err(|e| StoreError::Corrupt(format!("status {}: {e}", meta.status)))?;

        Ok(Some(CacheEntry {
            status,
            headers,
            body,
            stored_at: UNIX_EPOCH + Duration::from_millis(meta.stored_at_ms),
            expires_at: UNIX_EPOCH + Duration::from_millis(meta.expires_at_ms),
        }))
    }

    async fn put(&self, key: CacheKey, entry: CacheEntry, ttl: Duration) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;

        let stored_at_ms = system_ms(entry.stored_at);
        let meta = EntryMeta {
            key: key.to_string(),
            status: entry.status.as_u16(),
            headers: entry
                .headers
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
                .collect(),
            stored_at_ms,
            expires_at_ms: stored_at_ms.saturating_add(ttl.as_millis() as u64),
        };

        let mut raw = serde_json::to_vec(&meta)?;
        raw.push(b'\n');
        raw.extend_from_slice(&entry.body);

        write_then_rename(&self.tmp_path(&key), &self.entry_path(&key), &raw).await?;

        debug!(
            target: "hoard::store",
            cache_key = %key,
            layer = "disk",
            bytes = entry.body.len(),
            "Wrote entry"
        );
        Ok(())
    }

    async fn purge(&self, key: &CacheKey) -> Result<(), StoreError> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `raw` to `tmp` and move it over `dst`. `tmp` never outlives a failure.
async fn write_then_rename(tmp: &Path, dst: &Path, raw: &[u8]) -> std::io::Result<()> {
    let result = match fs::write(tmp, raw).await {
        Ok(()) => fs::rename(tmp, dst).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = fs::remove_file(tmp).await;
    }
    result
}

/// Expiry from the metadata line only. `Ok(None)` when the line does not decode.
async fn read_expiry(path: &Path) -> std::io::Result<Option<u64>> {
    let file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut line = Vec::new();
    BufReader::new(file).read_until(b'\n', &mut line).await?;
    Ok(serde_json::from_slice::<EntryMeta>(line.trim_ascii_end())
        .ok()
        .map(|meta| meta.expires_at_ms))
}

fn decode(raw: Vec<u8>) -> Result<(EntryMeta, Bytes), StoreError> {
    let split = raw
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| StoreError::Corrupt("missing metadata line".into()))?;
    let meta: EntryMeta = serde_json::from_slice(&raw[..split])
        .map_err(|e| StoreError::Corrupt(format!("metadata: {e}")))?;
    let body = Bytes::from(raw).slice(split + 1..);
    Ok((meta, body))
}

/// Hex SHA-256 of the key text; stable across builds and toolchains.
fn key_hash(key: &CacheKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.method());
    hasher.update(" ");
    hasher.update(key.url());
    format!("{:x}", hasher.finalize())
}

fn system_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn now_ms() -> u64 {
    system_ms(SystemTime::now())
}
