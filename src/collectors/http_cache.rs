//! Best-effort disk cache for HTTP responses.
//!
//! Entries are keyed by SHA-256 of `method | url | body` and stored as
//! a metadata JSON file plus a body file. Writes go to a temp path and
//! are renamed into place, so readers only ever see complete entries.
//! Every failure mode (missing file, corrupt metadata, IO error)
//! degrades to a cache miss; the directory is safe to delete at any
//! time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Metadata stored next to the body file.
#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    status: u16,
    headers: HashMap<String, String>,
    /// Unix seconds at store time.
    stored_at: u64,
}

/// A cached response read back from disk.
#[derive(Debug)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub age: Duration,
}

/// Disk-backed response cache.
#[derive(Debug, Clone)]
pub struct HttpCache {
    dir: PathBuf,
    ttl: Duration,
}

impl HttpCache {
    pub fn new(dir: PathBuf, ttl: Duration) -> Self {
        Self { dir, ttl }
    }

    /// Cache key for a request.
    pub fn key(method: &str, url: &str, body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update(b"|");
        hasher.update(url.as_bytes());
        hasher.update(b"|");
        hasher.update(body);
        format!("{:x}", hasher.finalize())
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn body_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.bin"))
    }

    /// Look up a fresh entry. Returns `None` on miss, expiry, or any
    /// read failure.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let meta_bytes = std::fs::read(self.meta_path(key)).ok()?;
        let meta: CacheMeta = serde_json::from_slice(&meta_bytes).ok()?;

        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
        let age_secs = now.saturating_sub(meta.stored_at);
        if Duration::from_secs(age_secs) >= self.ttl {
            return None;
        }

        let body = std::fs::read(self.body_path(key)).ok()?;
        debug!(key, age_secs, "http cache hit");
        Some(CachedResponse {
            status: meta.status,
            headers: meta.headers,
            body,
            age: Duration::from_secs(age_secs),
        })
    }

    /// Store a 2xx response. Non-2xx responses are never cached; write
    /// failures are logged and swallowed.
    pub fn put(&self, key: &str, status: u16, headers: &HashMap<String, String>, body: &[u8]) {
        if !(200..300).contains(&status) {
            return;
        }
        if let Err(e) = self.put_inner(key, status, headers, body) {
            warn!(key, error = %e, "http cache write failed");
        }
    }

    fn put_inner(
        &self,
        key: &str,
        status: u16,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let stored_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let meta = CacheMeta {
            status,
            headers: headers.clone(),
            stored_at,
        };

        let body_tmp = self.dir.join(format!("{key}.bin.tmp"));
        std::fs::write(&body_tmp, body)?;
        std::fs::rename(&body_tmp, self.body_path(key))?;

        let meta_tmp = self.dir.join(format!("{key}.json.tmp"));
        std::fs::write(&meta_tmp, serde_json::to_vec(&meta)?)?;
        std::fs::rename(&meta_tmp, self.meta_path(key))?;
        Ok(())
    }

    /// Remove expired entries. Returns the number of entries dropped.
    pub fn sweep(&self) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut dropped = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let expired = std::fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<CacheMeta>(&bytes).ok())
                .map(|meta| now.saturating_sub(meta.stored_at) >= self.ttl.as_secs())
                .unwrap_or(true);
            if expired {
                let key = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                let _ = std::fs::remove_file(&path);
                let _ = std::fs::remove_file(self.body_path(&key));
                dropped += 1;
            }
        }
        dropped
    }
}
