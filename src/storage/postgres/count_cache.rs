//! TTL cache for `COUNT(*)` results.
//!
//! Counting large filtered tables is expensive and paged listings repeat the
//! same count for every page. Keys are the SHA-256 of the count SQL plus its
//! parameters; entries expire after the configured TTL. Callers may bypass the
//! cache, which forces a fresh count and refreshes the entry.

use super::query::SqlQuery;
use crate::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy)]
struct CachedCount {
    count: usize,
    stored_at: Instant,
}

/// Count cache shared by every query of one backend.
#[derive(Debug)]
pub struct CountCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedCount>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CountCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key for a count statement.
    #[must_use]
    pub fn key(query: &SqlQuery) -> String {
        let mut hasher = Sha256::new();
        hasher.update(query.sql.as_bytes());
        for param in &query.params {
            hasher.update([0u8]);
            hasher.update(param.fingerprint().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Returns the cached count, or runs `fetch` and stores its result.
    ///
    /// The boolean is `true` when the count came from the cache.
    ///
    /// # Errors
    ///
    /// Propagates errors from `fetch`; nothing is cached in that case.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        bypass: bool,
        fetch: F,
    ) -> Result<(usize, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<usize>>,
    {
        if !bypass {
            if let Some(count) = self.lookup(key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("storage_count_cache_total", "result" => "hit").increment(1);
                return Ok((count, true));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("storage_count_cache_total", "result" => "miss").increment(1);

        let count = fetch().await?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.to_string(),
                CachedCount {
                    count,
                    stored_at: Instant::now(),
                },
            );
        Ok((count, false))
    }

    fn lookup(&self, key: &str) -> Option<usize> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.count)
    }

    /// Removes expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        before - entries.len()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookups answered from the cache.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that ran the count query.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Spawns a periodic sweep that stops once the cache is dropped.
    #[must_use]
    pub fn spawn_sweeper(cache: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::trace!(removed, "Swept expired count cache entries");
                }
            }
        })
    }
}
