use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::{watch, Mutex};

/// The canonical absolute-URI of a cacheable GET: scheme+host+port+path+query,
/// with the `Host` header and request-target reconciled to one form.
pub type CacheKey = String;

#[derive(Clone)]
struct CacheEntry {
    response: Bytes,
    size: usize,
}

/// A producer's outcome for the key it was handed a [`FillHandle`] for.
pub enum FillOutcome {
    Response(Bytes),
    Abandon,
}

/// Result of a cache lookup.
pub enum Lookup {
    Hit(Bytes),
    Pending(PendingWait),
    Miss(FillHandle),
}

struct CacheState {
    entries: LruCache<CacheKey, CacheEntry>,
    total_size: usize,
    /// One entry per key with an in-flight fill; the `watch::Sender` keeps the
    /// channel alive and is flipped to `true` by `complete`. Using `watch`
    /// rather than `Notify` means a waiter that subscribes *after* the
    /// producer already resolved still observes the result immediately —
    /// `watch::Sender::subscribe` snapshots the current value, so there is no
    /// lost-wakeup window between checking "is this in flight" and starting
    /// to wait, unlike a bare `Notify::notified()` call made after the lock
    /// protecting that check has already been released.
    inflight: HashMap<CacheKey, watch::Sender<bool>>,
}

/// Bounded map from [`CacheKey`] to cached response bytes with byte-budgeted
/// LRU eviction and single-flight fills. All mutating operations — including
/// lookups, which bump recency — are serialized under one lock; the lock is
/// only ever held for pointer/map manipulation, never across I/O.
#[derive(Clone)]
pub struct LruResponseCache {
    state: Arc<Mutex<CacheState>>,
    capacity_bytes: usize,
    max_entry_bytes: usize,
}

impl LruResponseCache {
    pub fn new(capacity_bytes: usize, max_entry_bytes: usize) -> Self {
        // The byte budget is the real bound (enforced in `complete`); the
        // entry-count cap given to `lru::LruCache` is a secondary safety net
        // so a flood of zero/near-zero-size responses can't grow the
        // map without bound.
        let entry_cap = capacity_bytes.clamp(1, 1_000_000);
        LruResponseCache {
            state: Arc::new(Mutex::new(CacheState {
                entries: LruCache::new(NonZeroUsize::new(entry_cap).unwrap()),
                total_size: 0,
                inflight: HashMap::new(),
            })),
            capacity_bytes,
            max_entry_bytes,
        }
    }

    pub fn max_entry_bytes(&self) -> usize {
        self.max_entry_bytes
    }

    /// Looks up `key`. A hit does not itself bump recency — callers that go
    /// on to actually serve the cached bytes should follow up with
    /// [`touch`](Self::touch); this lets a lookup that merely checks whether
    /// an entry exists (without serving it) leave recency untouched. Fresh
    /// misses become the caller's responsibility to fill; concurrent
    /// lookups of an in-flight key wait on the existing producer instead of
    /// starting their own.
    pub async fn lookup(&self, key: &str) -> Lookup {
        let mut guard = self.state.lock().await;
        if let Some(entry) = guard.entries.peek(key) {
            return Lookup::Hit(entry.response.clone());
        }
        if let Some(tx) = guard.inflight.get(key) {
            let rx = tx.subscribe();
            return Lookup::Pending(PendingWait {
                key: key.to_string(),
                rx,
                cache: self.clone(),
            });
        }
        let (tx, _rx) = watch::channel(false);
        guard.inflight.insert(key.to_string(), tx.clone());
        Lookup::Miss(FillHandle {
            key: key.to_string(),
            tx: Some(tx),
            state: self.state.clone(),
            completed: false,
        })
    }

    /// Bumps `key` to most-recently-used without touching its contents; a
    /// no-op on a miss. Called after a `Lookup::Hit` is actually served, so
    /// recency reflects bytes served rather than every peek at the map.
    pub async fn touch(&self, key: &str) {
        let mut guard = self.state.lock().await;
        let _ = guard.entries.get(key);
    }

    /// Resolves a fill: on `Response`, evicts LRU entries until the new entry
    /// fits within `capacity_bytes` and inserts it (entries larger than
    /// `max_entry_bytes` are never inserted); on `Abandon`, inserts nothing.
    /// Either way, wakes any waiters and lets a future lookup of this key
    /// start a fresh fill.
    pub async fn complete(&self, mut handle: FillHandle, outcome: FillOutcome) {
        let mut guard = self.state.lock().await;

        if let FillOutcome::Response(bytes) = outcome {
            let size = bytes.len();
            if size <= self.max_entry_bytes {
                while guard.total_size + size > self.capacity_bytes {
                    match guard.entries.pop_lru() {
                        Some((_, evicted)) => guard.total_size -= evicted.size,
                        None => break,
                    }
                }
                if guard.total_size + size <= self.capacity_bytes {
                    if let Some(old) = guard.entries.put(handle.key.clone(), CacheEntry { response: bytes, size }) {
                        guard.total_size -= old.size;
                    }
                    guard.total_size += size;
                }
            }
        }

        guard.inflight.remove(&handle.key);
        drop(guard);

        if let Some(tx) = handle.tx.take() {
            let _ = tx.send(true);
        }
        handle.completed = true;
    }

    #[cfg(test)]
    async fn total_size(&self) -> usize {
        self.state.lock().await.total_size
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}

/// A waiter for an in-flight fill of the same key. Resolving it re-runs the
/// lookup so a failed/abandoned fill hands the waiter its own fresh
/// [`FillHandle`] rather than silently returning nothing.
pub struct PendingWait {
    key: CacheKey,
    rx: watch::Receiver<bool>,
    cache: LruResponseCache,
}

impl PendingWait {
    pub async fn wait(mut self) -> Lookup {
        if !*self.rx.borrow() {
            let _ = self.rx.changed().await;
        }
        self.cache.lookup(&self.key).await
    }
}

/// A producer's exclusive claim on filling `key`. Must be resolved via
/// [`LruResponseCache::complete`]; if dropped without being resolved (e.g. the
/// connection handling it was cancelled), it abandons the fill itself so
/// waiters are never stuck forever.
pub struct FillHandle {
    key: CacheKey,
    tx: Option<watch::Sender<bool>>,
    state: Arc<Mutex<CacheState>>,
    completed: bool,
}

impl FillHandle {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FillHandle {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(tx) = self.tx.take() {
            let key = self.key.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                let mut guard = state.lock().await;
                guard.inflight.remove(&key);
                drop(guard);
                let _ = tx.send(true);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_then_hit_round_trip() {
        let cache = LruResponseCache::new(1024, 512);
        match cache.lookup("k").await {
            Lookup::Miss(handle) => {
                cache.complete(handle, FillOutcome::Response(Bytes::from_static(b"hello"))).await;
            }
            _ => panic!("expected miss"),
        }

        match cache.lookup("k").await {
            Lookup::Hit(bytes) => assert_eq!(bytes, Bytes::from_static(b"hello")),
            _ => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn abandon_leaves_no_entry() {
        let cache = LruResponseCache::new(1024, 512);
        match cache.lookup("k").await {
            Lookup::Miss(handle) => cache.complete(handle, FillOutcome::Abandon).await,
            _ => panic!("expected miss"),
        }
        match cache.lookup("k").await {
            Lookup::Miss(_) => {}
            _ => panic!("expected a fresh miss after abandon"),
        }
    }

    #[tokio::test]
    async fn oversized_entry_is_abandoned() {
        let cache = LruResponseCache::new(1024, 4);
        match cache.lookup("k").await {
            Lookup::Miss(handle) => {
                cache.complete(handle, FillOutcome::Response(Bytes::from_static(b"too-big"))).await;
            }
            _ => panic!("expected miss"),
        }
        assert_eq!(cache.total_size().await, 0);
        match cache.lookup("k").await {
            Lookup::Miss(_) => {}
            _ => panic!("oversized response must not be cached"),
        }
    }

    #[tokio::test]
    async fn eviction_keeps_size_within_budget() {
        let cache = LruResponseCache::new(10, 10);
        for (key, body) in [("a", "12345"), ("b", "12345"), ("c", "12345")] {
            match cache.lookup(key).await {
                Lookup::Miss(handle) => {
                    cache.complete(handle, FillOutcome::Response(Bytes::copy_from_slice(body.as_bytes()))).await;
                }
                _ => panic!("expected miss"),
            }
        }
        assert!(cache.total_size().await <= 10);
        // "a" should have been evicted as least-recently-used.
        match cache.lookup("a").await {
            Lookup::Miss(_) => {}
            _ => panic!("expected eviction of oldest entry"),
        }
        match cache.lookup("c").await {
            Lookup::Hit(_) => {}
            _ => panic!("expected most recent entry still cached"),
        }
    }

    #[tokio::test]
    async fn touch_protects_an_entry_from_eviction() {
        let cache = LruResponseCache::new(10, 10);
        for (key, body) in [("a", "12345"), ("b", "12345")] {
            match cache.lookup(key).await {
                Lookup::Miss(handle) => {
                    cache.complete(handle, FillOutcome::Response(Bytes::copy_from_slice(body.as_bytes()))).await;
                }
                _ => panic!("expected miss"),
            }
        }

        // "a" is the least recently used entry; touching it should make "b"
        // the eviction candidate instead once a third entry is inserted.
        cache.touch("a").await;

        match cache.lookup("c").await {
            Lookup::Miss(handle) => {
                cache.complete(handle, FillOutcome::Response(Bytes::copy_from_slice(b"12345"))).await;
            }
            _ => panic!("expected miss"),
        }

        match cache.lookup("a").await {
            Lookup::Hit(_) => {}
            _ => panic!("touched entry should have survived eviction"),
        }
        match cache.lookup("b").await {
            Lookup::Miss(_) => {}
            _ => panic!("untouched entry should have been evicted"),
        }
    }

    #[tokio::test]
    async fn single_flight_serializes_concurrent_misses() {
        let cache = LruResponseCache::new(1024, 512);

        let first = match cache.lookup("k").await {
            Lookup::Miss(handle) => handle,
            _ => panic!("expected first caller to get the miss"),
        };

        // A second concurrent caller for the same key must observe Pending,
        // not a second Miss.
        let second = cache.lookup("k").await;
        assert!(matches!(second, Lookup::Pending(_)));

        let waiter = tokio::spawn(async move {
            match second {
                Lookup::Pending(p) => p.wait().await,
                _ => unreachable!(),
            }
        });

        // Give the waiter a chance to register before the producer resolves.
        tokio::task::yield_now().await;

        cache.complete(first, FillOutcome::Response(Bytes::from_static(b"v"))).await;

        match waiter.await.unwrap() {
            Lookup::Hit(bytes) => assert_eq!(bytes, Bytes::from_static(b"v")),
            _ => panic!("waiter should observe the producer's outcome"),
        }
    }

    #[tokio::test]
    async fn dropping_a_fill_handle_without_completing_unblocks_waiters() {
        let cache = LruResponseCache::new(1024, 512);
        let handle = match cache.lookup("k").await {
            Lookup::Miss(handle) => handle,
            _ => panic!("expected miss"),
        };

        let pending = match cache.lookup("k").await {
            Lookup::Pending(p) => p,
            _ => panic!("expected pending"),
        };

        drop(handle); // simulate a cancelled handler that never calls complete()

        match pending.wait().await {
            Lookup::Miss(_) => {}
            _ => panic!("expected a fresh miss after an abandoned handle"),
        }
    }
}
