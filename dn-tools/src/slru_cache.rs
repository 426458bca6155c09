//! Weight-bounded segmented LRU cache with an async insertion-cookie
//! front end.
//!
//! New entries land in the probationary (younger) segment; a second access
//! promotes them into the protected (older) segment. Eviction drains the
//! younger segment first, the older segment spills back into the younger
//! one when it outgrows its share.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};

use crate::broadcast_future::BroadcastFuture;
use crate::lru_cache::LruCache;

/// Entry weight used for cache accounting, typically the payload size.
pub trait CacheWeight {
    fn cache_weight(&self) -> u64;
}

struct Weighted<V> {
    value: V,
    weight: u64,
}

pub struct SlruCache<K, V> {
    younger: LruCache<K, Weighted<V>>,
    older: LruCache<K, Weighted<V>>,
    younger_weight: u64,
    older_weight: u64,
    capacity: u64,
    older_capacity: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> SlruCache<K, V> {
    pub fn new(capacity: u64, younger_size_fraction: f64) -> Self {
        let younger_capacity = (capacity as f64 * younger_size_fraction) as u64;
        Self {
            younger: LruCache::unbounded(),
            older: LruCache::unbounded(),
            younger_weight: 0,
            older_weight: 0,
            capacity,
            older_capacity: capacity - younger_capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.younger.len() + self.older.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn weight(&self) -> u64 {
        self.younger_weight + self.older_weight
    }

    pub fn contains(&self, key: &K) -> bool {
        self.younger.contains(key) || self.older.contains(key)
    }

    /// Look the key up, promoting a younger entry into the older segment.
    pub fn find(&mut self, key: &K) -> Option<V> {
        if let Some(entry) = self.older.get(key) {
            return Some(entry.value.clone());
        }

        if let Some(entry) = self.younger.remove(key) {
            let value = entry.value.clone();
            self.younger_weight -= entry.weight;
            self.older_weight += entry.weight;
            self.older.insert(key.clone(), entry);
            self.spill_older();
            return Some(value);
        }

        None
    }

    /// Get without touching segment membership or access order.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.older
            .peek(key)
            .or_else(|| self.younger.peek(key))
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&mut self, key: K, value: V, weight: u64) {
        self.remove(&key);
        self.younger_weight += weight;
        self.younger.insert(key, Weighted { value, weight });
        self.evict();
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if let Some(entry) = self.younger.remove(key) {
            self.younger_weight -= entry.weight;
            return Some(entry.value);
        }
        if let Some(entry) = self.older.remove(key) {
            self.older_weight -= entry.weight;
            return Some(entry.value);
        }
        None
    }

    pub fn values(&self) -> Vec<V> {
        self.younger
            .values()
            .chain(self.older.values())
            .map(|entry| entry.value.clone())
            .collect()
    }

    fn spill_older(&mut self) {
        while self.older_weight > self.older_capacity {
            let Some((key, entry)) = self.older.pop_tail() else {
                break;
            };
            self.older_weight -= entry.weight;
            self.younger_weight += entry.weight;
            self.younger.insert(key, entry);
        }
    }

    fn evict(&mut self) {
        while self.weight() > self.capacity {
            if let Some((_, entry)) = self.younger.pop_tail() {
                self.younger_weight -= entry.weight;
            } else if let Some((_, entry)) = self.older.pop_tail() {
                self.older_weight -= entry.weight;
            } else {
                break;
            }
        }
    }
}

type ValueFuture<V> = Pin<Box<dyn Future<Output = Result<V, Error>> + Send>>;

/// Outcome of [`AsyncSlruCache::begin_insert`].
pub enum InsertOutcome<K: Eq + Hash + Clone, V: Clone + Send + 'static> {
    /// This caller owns the insertion and must resolve the cookie.
    Inserter(InsertCookie<K, V>),
    /// Another insertion is in flight; await its result.
    Waiter(ValueFuture<V>),
}

struct CacheState<K, V: Clone> {
    inner: Mutex<CacheInner<K, V>>,
    hit_count: AtomicU64,
}

struct CacheInner<K, V: Clone> {
    cache: SlruCache<K, V>,
    pending: HashMap<K, BroadcastFuture<V>>,
}

/// Async-safe SLRU cache supporting coalesced insertions: any number of
/// concurrent lookups for a missing key observe a single materialization.
pub struct AsyncSlruCache<K: Eq + Hash + Clone, V: Clone + Send + 'static> {
    state: Arc<CacheState<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone + Send + 'static> Clone for AsyncSlruCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + 'static, V: Clone + Send + 'static> AsyncSlruCache<K, V> {
    pub fn new(capacity: u64, younger_size_fraction: f64) -> Self {
        Self {
            state: Arc::new(CacheState {
                inner: Mutex::new(CacheInner {
                    cache: SlruCache::new(capacity, younger_size_fraction),
                    pending: HashMap::new(),
                }),
                hit_count: AtomicU64::new(0),
            }),
        }
    }

    /// Cache probe; counts a hit when the key is resident.
    pub fn find(&self, key: &K) -> Option<V> {
        let mut inner = self.state.inner.lock().unwrap();
        let found = inner.cache.find(key);
        if found.is_some() {
            self.state.hit_count.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Number of cache hits served so far.
    pub fn hit_count(&self) -> u64 {
        self.state.hit_count.load(Ordering::Relaxed)
    }

    /// Probe without counting a hit or touching the access order.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.state.inner.lock().unwrap().cache.peek(key)
    }

    /// Start an insertion for `key`, or join the one already in flight.
    ///
    /// A cached value short-circuits into an immediate waiter.
    pub fn begin_insert(&self, key: K, weight_of: fn(&V) -> u64) -> InsertOutcome<K, V> {
        let mut inner = self.state.inner.lock().unwrap();

        if let Some(value) = inner.cache.find(&key) {
            self.state.hit_count.fetch_add(1, Ordering::Relaxed);
            return InsertOutcome::Waiter(Box::pin(futures::future::ok(value)));
        }

        if let Some(pending) = inner.pending.get(&key) {
            return InsertOutcome::Waiter(Box::pin(pending.listen()));
        }

        let (broadcast, trigger) = BroadcastFuture::new_oneshot();
        inner.pending.insert(key.clone(), broadcast);

        InsertOutcome::Inserter(InsertCookie {
            state: Arc::clone(&self.state),
            key: Some(key),
            trigger: Some(trigger),
            weight_of,
        })
    }

    /// Insert a value directly, bypassing cookies. Existing entries are
    /// replaced.
    pub fn insert(&self, key: K, value: V, weight: u64) {
        let mut inner = self.state.inner.lock().unwrap();
        inner.cache.insert(key, value, weight);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.state.inner.lock().unwrap();
        inner.cache.remove(key)
    }

    pub fn weight(&self) -> u64 {
        self.state.inner.lock().unwrap().cache.weight()
    }

    pub fn values(&self) -> Vec<V> {
        self.state.inner.lock().unwrap().cache.values()
    }
}

/// Exclusive permission to materialize one cache entry. Dropping the cookie
/// without completing it fails all waiters, which may then retry.
pub struct InsertCookie<K: Eq + Hash + Clone, V: Clone + Send + 'static> {
    state: Arc<CacheState<K, V>>,
    key: Option<K>,
    trigger: Option<tokio::sync::oneshot::Sender<Result<V, Error>>>,
    weight_of: fn(&V) -> u64,
}

impl<K: Eq + Hash + Clone, V: Clone + Send + 'static> InsertCookie<K, V> {
    /// Publish the value: inserts into the cache and wakes all waiters.
    pub fn complete(mut self, value: V) {
        let key = self.key.take().unwrap();
        let weight = (self.weight_of)(&value);
        {
            let mut inner = self.state.inner.lock().unwrap();
            inner.cache.insert(key.clone(), value.clone(), weight);
            inner.pending.remove(&key);
        }
        if let Some(trigger) = self.trigger.take() {
            let _ = trigger.send(Ok(value));
        }
    }

    /// Abort the insertion, failing all waiters with `err`.
    pub fn fail(mut self, err: Error) {
        self.abort(err);
    }

    fn abort(&mut self, err: Error) {
        if let Some(key) = self.key.take() {
            let mut inner = self.state.inner.lock().unwrap();
            inner.pending.remove(&key);
        }
        if let Some(trigger) = self.trigger.take() {
            let _ = trigger.send(Err(err));
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone + Send + 'static> Drop for InsertCookie<K, V> {
    fn drop(&mut self) {
        self.abort(format_err!("cache insertion abandoned"));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_slru_eviction_order() {
        let mut cache = SlruCache::new(100, 0.5);

        cache.insert("a", 1, 40);
        cache.insert("b", 2, 40);
        // promote "a" into the older segment
        assert_eq!(cache.find(&"a"), Some(1));

        // "c" overflows the total capacity; the younger tail ("b") goes
        cache.insert("c", 3, 40);
        assert_eq!(cache.peek(&"b"), None);
        assert_eq!(cache.peek(&"a"), Some(1));
        assert_eq!(cache.peek(&"c"), Some(3));
        assert_eq!(cache.weight(), 80);
    }

    #[test]
    fn test_slru_remove() {
        let mut cache = SlruCache::new(100, 0.25);
        cache.insert(1u32, "x", 10);
        assert_eq!(cache.find(&1), Some("x"));
        assert_eq!(cache.remove(&1), Some("x"));
        assert_eq!(cache.weight(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_cache_coalescing() {
        use std::sync::atomic::AtomicUsize;

        let cache: AsyncSlruCache<u32, u32> = AsyncSlruCache::new(1024, 0.25);
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut tasks = vec![];
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = Arc::clone(&fetches);
            tasks.push(tokio::spawn(async move {
                match cache.begin_insert(7, |_| 4) {
                    InsertOutcome::Inserter(cookie) => {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        cookie.complete(42);
                        42
                    }
                    InsertOutcome::Waiter(fut) => fut.await.unwrap(),
                }
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), 42);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cache.find(&7), Some(42));
    }
}
