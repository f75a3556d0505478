//! Duplicate cache contract and in-memory implementation

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::fingerprint::{Fingerprint, Signature};
use crate::error::CacheError;

/// One check-and-insert request.
#[derive(Debug, Clone)]
pub struct DedupQuery {
    /// Cache partition: a room id, or a shared scope name
    pub scope: String,
    pub fingerprint: Fingerprint,
    pub signature: Signature,
    /// Largest signature distance counted as a duplicate; `None` for exact match only
    pub max_distance: Option<f32>,
    /// Producer timestamp, kept as the reference for later duplicates
    pub timestamp_ms: i64,
}

/// Outcome of a check-and-insert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheLookup {
    /// A live entry matched; nothing was inserted
    Hit {
        original_timestamp_ms: i64,
        distance: f32,
    },
    /// No live entry matched; the query was inserted
    Miss,
}

/// Shared duplicate cache.
///
/// `check_and_insert` must be atomic per fingerprint: two concurrent queries
/// with the same fingerprint can never both observe `Miss`.
#[async_trait::async_trait]
pub trait DuplicateCache: Send + Sync {
    async fn check_and_insert(
        &self,
        query: &DedupQuery,
        window: Duration,
    ) -> Result<CacheLookup, CacheError>;

    /// Remove the entry for `fingerprint` in `scope`. Missing entries are not an error.
    async fn release(&self, _scope: &str, _fingerprint: &Fingerprint) -> Result<(), CacheError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedEntry {
    signature: Signature,
    timestamp_ms: i64,
    inserted_at: Instant,
}

#[derive(Default)]
struct ScopeEntries {
    by_fingerprint: HashMap<Fingerprint, CachedEntry>,
    /// Insertion order, oldest first
    order: VecDeque<Fingerprint>,
}

impl ScopeEntries {
    fn expire(&mut self, window: Duration, now: Instant) {
        while let Some(oldest) = self.order.front() {
            let expired = self
                .by_fingerprint
                .get(oldest)
                .map_or(true, |e| now.duration_since(e.inserted_at) > window);
            if !expired {
                break;
            }
            if let Some(fp) = self.order.pop_front() {
                self.by_fingerprint.remove(&fp);
            }
        }
    }

    fn find(&self, query: &DedupQuery) -> Option<(CachedEntry, f32)> {
        if let Some(entry) = self.by_fingerprint.get(&query.fingerprint) {
            return Some((*entry, 0.0));
        }
        let max_distance = query.max_distance?;
        // Newest first: recent frames are the likeliest near-duplicates
        self.order.iter().rev().find_map(|fp| {
            let entry = self.by_fingerprint.get(fp)?;
            let distance = entry.signature.distance(&query.signature);
            (distance <= max_distance).then_some((*entry, distance))
        })
    }
}

/// In-process duplicate cache.
///
/// A single lock covers lookup and insert, which makes `check_and_insert`
/// atomic across all rooms. Each scope keeps at most `capacity` entries;
/// the oldest is evicted first.
pub struct MemoryDuplicateCache {
    scopes: Mutex<HashMap<String, ScopeEntries>>,
    capacity: usize,
}

impl MemoryDuplicateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            scopes: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live entries in a scope (expired entries may still be counted).
    pub async fn len(&self, scope: &str) -> usize {
        self.scopes
            .lock()
            .await
            .get(scope)
            .map_or(0, |s| s.by_fingerprint.len())
    }
}

impl Default for MemoryDuplicateCache {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[async_trait::async_trait]
impl DuplicateCache for MemoryDuplicateCache {
    async fn check_and_insert(
        &self,
        query: &DedupQuery,
        window: Duration,
    ) -> Result<CacheLookup, CacheError> {
        let now = Instant::now();
        let mut scopes = self.scopes.lock().await;
        let entries = scopes.entry(query.scope.clone()).or_default();

        entries.expire(window, now);

        if let Some((entry, distance)) = entries.find(query) {
            return Ok(CacheLookup::Hit {
                original_timestamp_ms: entry.timestamp_ms,
                distance,
            });
        }

        entries.by_fingerprint.insert(
            query.fingerprint,
            CachedEntry {
                signature: query.signature,
                timestamp_ms: query.timestamp_ms,
                inserted_at: now,
            },
        );
        entries.order.push_back(query.fingerprint);

        while entries.order.len() > self.capacity {
            if let Some(evicted) = entries.order.pop_front() {
                entries.by_fingerprint.remove(&evicted);
            }
        }

        Ok(CacheLookup::Miss)
    }

    async fn release(&self, scope: &str, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        let mut scopes = self.scopes.lock().await;
        if let Some(entries) = scopes.get_mut(scope) {
            if entries.by_fingerprint.remove(fingerprint).is_some() {
                entries.order.retain(|fp| fp != fingerprint);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn query(scope: &str, payload: &[u8], ts: i64, max_distance: Option<f32>) -> DedupQuery {
        DedupQuery {
            scope: scope.to_string(),
            fingerprint: Fingerprint::of(payload),
            signature: Signature::of(payload),
            max_distance,
            timestamp_ms: ts,
        }
    }

    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn second_identical_query_hits_with_first_timestamp() {
        let cache = MemoryDuplicateCache::default();
        assert_eq!(
            cache
                .check_and_insert(&query("room", b"same", 10, None), WINDOW)
                .await
                .unwrap(),
            CacheLookup::Miss
        );
        assert_eq!(
            cache
                .check_and_insert(&query("room", b"same", 20, None), WINDOW)
                .await
                .unwrap(),
            CacheLookup::Hit {
                original_timestamp_ms: 10,
                distance: 0.0
            }
        );
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let cache = MemoryDuplicateCache::default();
        cache
            .check_and_insert(&query("a", b"payload", 1, None), WINDOW)
            .await
            .unwrap();
        let other = cache
            .check_and_insert(&query("b", b"payload", 2, None), WINDOW)
            .await
            .unwrap();
        assert_eq!(other, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn entries_expire_after_window() {
        let cache = MemoryDuplicateCache::default();
        let window = Duration::from_millis(30);
        cache
            .check_and_insert(&query("room", b"x", 1, None), window)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        let again = cache
            .check_and_insert(&query("room", b"x", 2, None), window)
            .await
            .unwrap();
        assert_eq!(again, CacheLookup::Miss);
        assert_eq!(cache.len("room").await, 1);
    }

    #[tokio::test]
    async fn near_match_requires_max_distance() {
        let cache = MemoryDuplicateCache::default();
        let base: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        let mut near = base.clone();
        near[7] ^= 0x01;

        cache
            .check_and_insert(&query("room", &base, 1, Some(0.1)), WINDOW)
            .await
            .unwrap();

        // Exact-only query does not match a different fingerprint
        let exact = cache
            .check_and_insert(&query("room", &near, 2, None), WINDOW)
            .await
            .unwrap();
        assert_eq!(exact, CacheLookup::Miss);

        let mut nearer = base.clone();
        nearer[9] ^= 0x01;
        let similar = cache
            .check_and_insert(&query("room", &nearer, 3, Some(0.1)), WINDOW)
            .await
            .unwrap();
        assert!(matches!(similar, CacheLookup::Hit { .. }));
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let cache = MemoryDuplicateCache::new(2);
        for (i, payload) in [b"one", b"two", b"thr"].iter().enumerate() {
            cache
                .check_and_insert(&query("room", *payload, i as i64, None), WINDOW)
                .await
                .unwrap();
        }
        assert_eq!(cache.len("room").await, 2);
        let first = cache
            .check_and_insert(&query("room", b"one", 9, None), WINDOW)
            .await
            .unwrap();
        assert_eq!(first, CacheLookup::Miss);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_queries_yield_one_miss() {
        let cache = Arc::new(MemoryDuplicateCache::default());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                cache
                    .check_and_insert(&query("shared", b"contended", i, None), WINDOW)
                    .await
                    .unwrap()
            }));
        }

        let mut misses = 0;
        for task in tasks {
            if task.await.unwrap() == CacheLookup::Miss {
                misses += 1;
            }
        }
        assert_eq!(misses, 1);
    }

    #[tokio::test]
    async fn release_removes_only_that_entry() {
        let cache = MemoryDuplicateCache::default();
        for (ts, payload) in [(1, b"keep"), (2, b"drop")] {
            cache
                .check_and_insert(&query("room", payload, ts, None), WINDOW)
                .await
                .unwrap();
        }

        cache.release("room", &Fingerprint::of(b"drop")).await.unwrap();
        cache.release("other", &Fingerprint::of(b"keep")).await.unwrap();
        assert_eq!(cache.len("room").await, 1);

        let dropped = cache
            .check_and_insert(&query("room", b"drop", 3, None), WINDOW)
            .await
            .unwrap();
        assert_eq!(dropped, CacheLookup::Miss);
        let kept = cache
            .check_and_insert(&query("room", b"keep", 4, None), WINDOW)
            .await
            .unwrap();
        assert!(matches!(kept, CacheLookup::Hit { original_timestamp_ms: 1, .. }));
    }
}
