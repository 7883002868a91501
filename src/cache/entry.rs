//! Subject Record Cache
//!
//! Capacity-bounded cache keyed by subject id. `find` locks the key: a
//! second `find` for the same key waits until the first handle is released,
//! so at most one caller populates a missing record at a time. Different
//! keys never wait on each other.
//!
//! Staleness is not enforced here. Callers compare the stamp on a hit with
//! their own freshness window and `remove` stale records.
//!
//! When a release with capacity recheck finds the cache over either bound,
//! unpinned records are swept in least-recently-used order until the cache
//! is back under half of both bounds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{Mutex as KeyLock, OwnedMutexGuard};

use crate::clock::Timestamp;
use crate::config::CacheConfig;

/// Fraction of each bound a sweep shrinks the cache to
const CLEAN_QUOTA: f64 = 0.5;

/// Approximate memory footprint of a cached value
pub trait CacheSize {
    fn cache_size(&self) -> usize;
}

impl CacheSize for String {
    fn cache_size(&self) -> usize {
        std::mem::size_of::<String>() + self.len()
    }
}

/// A cached value and the time it was fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<V> {
    pub value: V,
    pub stamp: Timestamp,
}

type Cell<V> = Arc<KeyLock<Option<Cached<V>>>>;

struct Slot<V> {
    cell: Cell<V>,
    generation: u64,
    /// Handles outstanding for this key, held or waiting
    pins: usize,
    /// Whether the cell held a value at the last release
    filled: bool,
    size: usize,
    last_used: u64,
}

struct Inner<V> {
    slots: HashMap<u32, Slot<V>>,
    bytes: usize,
    tick: u64,
    next_generation: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

struct Shared<V> {
    inner: Mutex<Inner<V>>,
    max_bytes: usize,
    max_elements: usize,
}

/// Cache counters for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub elements: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Cache of subject records
pub struct EntryCache<V> {
    shared: Arc<Shared<V>>,
}

/// A locked cache key, returned by [`EntryCache::find`]
///
/// Holding a handle keeps every other `find` for the same key waiting.
/// Give it back with [`EntryCache::release`]; a handle that is dropped
/// instead releases itself without a capacity recheck.
pub struct EntryHandle<V: CacheSize> {
    owner: Arc<Shared<V>>,
    key: u32,
    generation: u64,
    guard: Option<OwnedMutexGuard<Option<Cached<V>>>>,
    released: bool,
}

impl<V: CacheSize> Shared<V> {
    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settle(
        &self,
        key: u32,
        generation: u64,
        guard: Option<OwnedMutexGuard<Option<Cached<V>>>>,
        recheck: bool,
    ) {
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;

        match inner.slots.get_mut(&key) {
            Some(slot) if slot.generation == generation => {
                let mut delta: isize = 0;
                if let Some(content) = guard.as_deref() {
                    let size = content.as_ref().map(|c| c.value.cache_size()).unwrap_or(0);
                    delta = size as isize - slot.size as isize;
                    slot.size = size;
                    slot.filled = content.is_some();
                }
                slot.last_used = tick;
                slot.pins = slot.pins.saturating_sub(1);
                let drop_slot = slot.pins == 0 && !slot.filled;

                inner.bytes = (inner.bytes as isize + delta).max(0) as usize;
                if drop_slot {
                    inner.slots.remove(&key);
                }
            }
            _ => {
                tracing::warn!(
                    uin = key,
                    "Released a cache handle the cache does not track, ignoring"
                );
            }
        }

        if recheck {
            self.sweep(&mut inner);
        }

        drop(inner);
        drop(guard);
    }

    fn sweep(&self, inner: &mut Inner<V>) {
        if inner.bytes <= self.max_bytes && inner.slots.len() <= self.max_elements {
            return;
        }

        let target_bytes = (self.max_bytes as f64 * CLEAN_QUOTA) as usize;
        let target_elements = (self.max_elements as f64 * CLEAN_QUOTA) as usize;

        let mut candidates: Vec<(u64, u32)> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.pins == 0)
            .map(|(key, slot)| (slot.last_used, *key))
            .collect();
        candidates.sort_unstable();

        let mut evicted = 0u64;
        for (_, key) in candidates {
            if inner.bytes <= target_bytes && inner.slots.len() <= target_elements {
                break;
            }
            if let Some(slot) = inner.slots.remove(&key) {
                inner.bytes = inner.bytes.saturating_sub(slot.size);
                evicted += 1;
            }
        }
        inner.evictions += evicted;

        tracing::info!(
            evicted,
            elements = inner.slots.len(),
            bytes = inner.bytes,
            "Subject cache swept"
        );
    }
}

impl<V: CacheSize> EntryCache<V> {
    /// Create a cache bounded by total value size and element count
    pub fn new(max_bytes: usize, max_elements: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    slots: HashMap::new(),
                    bytes: 0,
                    tick: 0,
                    next_generation: 0,
                    hits: 0,
                    misses: 0,
                    evictions: 0,
                }),
                max_bytes,
                max_elements,
            }),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_bytes, config.max_elements)
    }

    /// Lock `key` and return its handle. A hit carries the cached value; on
    /// a miss the caller fetches the record and may [`fill`](EntryHandle::fill)
    /// the handle before releasing it.
    pub async fn find(&self, key: u32) -> EntryHandle<V> {
        let (cell, generation) = {
            let mut inner = self.shared.lock();
            let next = inner.next_generation;
            let slot = inner.slots.entry(key).or_insert_with(|| Slot {
                cell: Arc::new(KeyLock::new(None)),
                generation: next,
                pins: 0,
                filled: false,
                size: 0,
                last_used: 0,
            });
            slot.pins += 1;
            let pinned = (Arc::clone(&slot.cell), slot.generation);
            if pinned.1 == next {
                inner.next_generation += 1;
            }
            pinned
        };

        // Dropping this future while it waits drops the handle, which unpins.
        let mut handle = EntryHandle {
            owner: Arc::clone(&self.shared),
            key,
            generation,
            guard: None,
            released: false,
        };
        let guard = cell.lock_owned().await;

        {
            let mut inner = self.shared.lock();
            if guard.is_some() {
                inner.hits += 1;
            } else {
                inner.misses += 1;
            }
        }

        handle.guard = Some(guard);
        handle
    }

    /// Unlock a handle, sweeping the cache if `recheck` is set and a bound
    /// is exceeded.
    pub fn release(&self, mut handle: EntryHandle<V>, recheck: bool) {
        if !Arc::ptr_eq(&self.shared, &handle.owner) {
            tracing::warn!(
                uin = handle.key,
                "Cache handle released into a different cache, returning it to its owner"
            );
        }
        handle.settle(recheck);
    }

    /// Drop the record behind a locked handle
    pub fn remove(&self, handle: &mut EntryHandle<V>) {
        if let Some(guard) = handle.guard.as_mut() {
            **guard = None;
        }
    }

    /// Insert or replace the record for `key`
    pub async fn add(&self, key: u32, value: V, stamp: Timestamp) {
        let mut handle = self.find(key).await;
        handle.fill(value, stamp);
        self.release(handle, true);
    }

    /// Drop the record for `key`, waiting for any holder to release it
    pub async fn invalidate(&self, key: u32) {
        let mut handle = self.find(key).await;
        self.remove(&mut handle);
        self.release(handle, false);
    }

    /// Number of tracked keys (records plus keys being populated)
    pub fn len(&self) -> usize {
        self.shared.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.shared.lock();
        CacheStats {
            elements: inner.slots.len(),
            bytes: inner.bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

impl<V: CacheSize> EntryHandle<V> {
    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn cached(&self) -> Option<&Cached<V>> {
        self.guard.as_deref().and_then(Option::as_ref)
    }

    pub fn value(&self) -> Option<&V> {
        self.cached().map(|c| &c.value)
    }

    pub fn stamp(&self) -> Option<Timestamp> {
        self.cached().map(|c| c.stamp)
    }

    pub fn is_hit(&self) -> bool {
        self.cached().is_some()
    }

    /// Store a freshly fetched value under this key
    pub fn fill(&mut self, value: V, stamp: Timestamp) {
        if let Some(guard) = self.guard.as_mut() {
            **guard = Some(Cached { value, stamp });
        }
    }

    fn settle(&mut self, recheck: bool) {
        if self.released {
            return;
        }
        self.released = true;
        let guard = self.guard.take();
        self.owner.settle(self.key, self.generation, guard, recheck);
    }
}

impl<V: CacheSize> Drop for EntryHandle<V> {
    fn drop(&mut self) {
        self.settle(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn cache() -> EntryCache<String> {
        EntryCache::new(1024 * 1024, 100)
    }

    #[tokio::test]
    async fn test_find_absent_is_miss() {
        let cache = cache();
        let handle = cache.find(42).await;
        assert!(!handle.is_hit());
        cache.release(handle, false);

        // Nothing was populated, so nothing is tracked
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_add_then_find() {
        let cache = cache();
        cache.add(42, "alice".to_string(), 1_000).await;

        let handle = cache.find(42).await;
        assert_eq!(handle.value().map(String::as_str), Some("alice"));
        assert_eq!(handle.stamp(), Some(1_000));
        cache.release(handle, false);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_fill_on_miss() {
        let cache = cache();
        let mut handle = cache.find(7).await;
        assert!(!handle.is_hit());
        handle.fill("bob".to_string(), 5);
        cache.release(handle, true);

        let handle = cache.find(7).await;
        assert_eq!(handle.value().map(String::as_str), Some("bob"));
        cache.release(handle, false);
        assert!(cache.stats().bytes > 0);
    }

    #[tokio::test]
    async fn test_remove_then_refetch() {
        let cache = cache();
        cache.add(3, "stale".to_string(), 0).await;

        let mut handle = cache.find(3).await;
        assert!(handle.is_hit());
        cache.remove(&mut handle);
        cache.release(handle, false);

        let handle = cache.find(3).await;
        assert!(!handle.is_hit());
        cache.release(handle, false);
        assert_eq!(cache.stats().bytes, 0);
    }

    #[tokio::test]
    async fn test_concurrent_find_populates_once() {
        let cache = Arc::new(cache());
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let fetches = Arc::clone(&fetches);
            tasks.push(tokio::spawn(async move {
                let mut handle = cache.find(11).await;
                if !handle.is_hit() {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    handle.fill("fetched".to_string(), 1);
                }
                let seen = handle.value().cloned();
                cache.release(handle, false);
                seen
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().as_deref(), Some("fetched"));
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_wait() {
        let cache = cache();
        let held = cache.find(1).await;

        let other = tokio::time::timeout(Duration::from_millis(200), cache.find(2))
            .await
            .expect("find on another key must not wait");
        cache.release(other, false);
        cache.release(held, false);
    }

    #[tokio::test]
    async fn test_sweep_evicts_least_recently_used() {
        let cache = EntryCache::new(1024 * 1024, 4);
        for key in 1..=4u32 {
            cache.add(key, format!("v{}", key), 0).await;
        }

        // Touch key 1 so it is the most recently used
        let handle = cache.find(1).await;
        cache.release(handle, false);

        cache.add(5, "v5".to_string(), 0).await;

        assert!(cache.len() <= 2);
        for key in [1u32, 5] {
            let handle = cache.find(key).await;
            assert!(handle.is_hit(), "key {} should survive", key);
            cache.release(handle, false);
        }
        assert!(cache.stats().evictions >= 3);
    }

    #[tokio::test]
    async fn test_sweep_respects_byte_bound() {
        let cache = EntryCache::new(200, 100);
        for key in 0..10u32 {
            cache.add(key, "x".repeat(40), 0).await;
        }
        assert!(cache.stats().bytes <= 200);
    }

    #[tokio::test]
    async fn test_held_records_are_not_swept() {
        let cache = EntryCache::new(1024, 2);
        cache.add(1, "one".to_string(), 0).await;
        let held = cache.find(1).await;

        for key in 2..=6u32 {
            cache.add(key, "n".to_string(), 0).await;
        }

        assert_eq!(held.value().map(String::as_str), Some("one"));
        cache.release(held, false);
        let again = cache.find(1).await;
        assert!(again.is_hit());
        cache.release(again, false);
    }

    #[tokio::test]
    async fn test_dropped_handle_releases() {
        let cache = cache();
        {
            let mut handle = cache.find(9).await;
            handle.fill("kept".to_string(), 0);
        }

        let handle = tokio::time::timeout(Duration::from_millis(200), cache.find(9))
            .await
            .expect("dropped handle must unlock the key");
        assert!(handle.is_hit());
        cache.release(handle, false);
    }

    #[tokio::test]
    async fn test_foreign_release_is_tolerated() {
        let a = cache();
        let b = cache();
        let mut handle = a.find(4).await;
        handle.fill("a".to_string(), 0);

        b.release(handle, true);

        let handle = a.find(4).await;
        assert!(handle.is_hit());
        a.release(handle, false);
        assert!(b.is_empty());
    }
}
