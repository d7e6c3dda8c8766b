//! In-process LRU cache with O(1) access/update/eviction.
//!
//! State is a slab of nodes (`Vec<Option<MemoryNode<V>>>`) plus a free list,
//! linked into a doubly-linked list ordered by recency (head = most recently
//! used), indexed by a `HashMap<String, usize>` from key to slab slot. A
//! single `parking_lot::Mutex` serializes every mutation; long trims release
//! it every ten evictions so a writer never holds it for an unbounded span.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::MemoryConfig;
use crate::item::MemoryNode;
use crate::release::{release, Releasable};

/// Nodes are released in batches of this size, dropping the lock between
/// batches so a large trim never monopolizes the mutex.
const EVICTION_BATCH: usize = 10;

struct Inner<T> {
    slots: Vec<Option<MemoryNode<Arc<T>>>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    total_count: u64,
    total_cost: u64,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            total_count: 0,
            total_cost: 0,
        }
    }

    fn node(&self, idx: usize) -> &MemoryNode<Arc<T>> {
        self.slots[idx].as_ref().expect("live index points at occupied slot")
    }

    fn node_mut(&mut self, idx: usize) -> &mut MemoryNode<Arc<T>> {
        self.slots[idx].as_mut().expect("live index points at occupied slot")
    }

    /// Detaches `idx` from the linked list without touching `index` or totals.
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let n = self.node(idx);
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
    }

    /// Attaches `idx` at the head; `idx` must not currently be linked.
    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let n = self.node_mut(idx);
            n.prev = None;
            n.next = old_head;
        }
        match old_head {
            Some(h) => self.node_mut(h).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
        self.node_mut(idx).last_access = Instant::now();
    }

    fn insert_new(&mut self, key: String, value: Arc<T>, cost: u64) -> usize {
        let node = MemoryNode {
            key: key.clone(),
            value,
            cost,
            last_access: Instant::now(),
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
        self.total_count += 1;
        self.total_cost += cost;
        idx
    }

    fn take(&mut self, idx: usize) -> MemoryNode<Arc<T>> {
        self.unlink(idx);
        let node = self.slots[idx].take().expect("live index points at occupied slot");
        self.free.push(idx);
        self.index.remove(&node.key);
        self.total_count -= 1;
        self.total_cost -= node.cost;
        node
    }

    fn evict_tail(&mut self) -> Option<MemoryNode<Arc<T>>> {
        let idx = self.tail?;
        Some(self.take(idx))
    }

    fn tail_age(&self, now: Instant) -> Option<Duration> {
        let idx = self.tail?;
        Some(now.saturating_duration_since(self.node(idx).last_access))
    }
}

/// In-process, thread-safe LRU cache over `(key, value, cost)` triples.
///
/// Values are stored behind `Arc<T>` so `get` can hand the caller a shared
/// reference without cloning the value itself.
pub struct MemoryCache<T> {
    inner: Mutex<Inner<T>>,
    config: MemoryConfig,
    name: Mutex<Option<String>>,
    shutdown: Arc<Notify>,
    trim_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> MemoryCache<T> {
    pub fn new(config: MemoryConfig) -> Arc<Self> {
        let cache = Arc::new(Self {
            inner: Mutex::new(Inner::new()),
            config,
            name: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            trim_handle: Mutex::new(None),
        });
        let handle = spawn_trim_timer(cache.clone());
        *cache.trim_handle.lock() = Some(handle);
        cache
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = Some(name.into());
    }

    pub fn total_count(&self) -> u64 {
        self.inner.lock().total_count
    }

    pub fn total_cost(&self) -> u64 {
        self.inner.lock().total_cost
    }

    /// Presence check; does not affect recency.
    pub fn contains(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        self.inner.lock().index.contains_key(key)
    }

    /// Returns the value for `key`, moving it to the head of the LRU list.
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        if key.is_empty() {
            return None;
        }
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(key)?;
        inner.move_to_front(idx);
        Some(inner.node(idx).value.clone())
    }

    /// Upserts `key`. Triggers a synchronous, best-effort trim if either cap
    /// is exceeded after the write.
    pub fn set(&self, key: impl Into<String>, value: T, cost: u64) {
        let key = key.into();
        if key.is_empty() {
            return;
        }
        let value = Arc::new(value);
        {
            let mut inner = self.inner.lock();
            match inner.index.get(&key).copied() {
                Some(idx) => {
                    let old_cost = inner.node(idx).cost;
                    inner.node_mut(idx).value = value;
                    inner.node_mut(idx).cost = cost;
                    inner.total_cost = inner.total_cost - old_cost + cost;
                    inner.move_to_front(idx);
                }
                None => {
                    inner.insert_new(key, value, cost);
                }
            }
        }
        self.trim_after_set();
    }

    /// Removes `key` if present, handing its value to the release path.
    pub fn remove(&self, key: &str) {
        if key.is_empty() {
            return;
        }
        let removed = {
            let mut inner = self.inner.lock();
            inner.index.get(key).copied().map(|idx| inner.take(idx))
        };
        if let Some(node) = removed {
            release(&self.config.release_policy, vec![Box::new(node.value) as Releasable]);
        }
    }

    /// Empties the cache in one step, handing every value to the release path.
    pub fn remove_all(&self) {
        let detached = {
            let mut inner = self.inner.lock();
            let values: Vec<Releasable> = std::mem::take(&mut inner.slots)
                .into_iter()
                .flatten()
                .map(|n| Box::new(n.value) as Releasable)
                .collect();
            inner.free.clear();
            inner.index.clear();
            inner.head = None;
            inner.tail = None;
            inner.total_count = 0;
            inner.total_cost = 0;
            values
        };
        release(&self.config.release_policy, detached);
    }

    pub fn trim_to_count(&self, count: u64) {
        self.batched_evict(|inner| inner.total_count > count);
    }

    pub fn trim_to_cost(&self, cost: u64) {
        self.batched_evict(|inner| inner.total_cost > cost);
    }

    pub fn trim_to_age(&self, age: Duration) {
        let now = Instant::now();
        self.batched_evict(move |inner| inner.tail_age(now).is_some_and(|a| a > age));
    }

    fn trim_after_set(&self) {
        let count_limit = self.config.count_limit;
        let cost_limit = self.config.cost_limit;
        self.batched_evict(|inner| inner.total_count > count_limit || inner.total_cost > cost_limit);
    }

    /// Evicts tail nodes while `keep_evicting` holds, releasing the mutex
    /// every [`EVICTION_BATCH`] evictions.
    fn batched_evict(&self, keep_evicting: impl Fn(&Inner<T>) -> bool) {
        loop {
            let batch: Vec<MemoryNode<Arc<T>>> = {
                let mut inner = self.inner.lock();
                let mut batch = Vec::new();
                while batch.len() < EVICTION_BATCH && keep_evicting(&inner) {
                    match inner.evict_tail() {
                        Some(node) => batch.push(node),
                        None => break,
                    }
                }
                batch
            };
            if batch.is_empty() {
                break;
            }
            let values: Vec<Releasable> =
                batch.into_iter().map(|n| Box::new(n.value) as Releasable).collect();
            release(&self.config.release_policy, values);
        }
    }

    /// Stops the periodic trim timer and waits for it to exit. No trim fires
    /// after this returns.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        if let Some(handle) = self.trim_handle.lock().take() {
            let _ = handle.await;
        }
    }
}

fn spawn_trim_timer<T: Send + Sync + 'static>(cache: Arc<MemoryCache<T>>) -> JoinHandle<()> {
    let shutdown = cache.shutdown.clone();
    let interval = cache.config.auto_trim_interval;
    tokio::task::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cache.trim_to_count(cache.config.count_limit);
                    cache.trim_to_cost(cache.config.cost_limit);
                    if let Some(age) = cache.config.age_limit {
                        cache.trim_to_age(age);
                    }
                }
                _ = shutdown.notified() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;

    fn cache<T: Send + Sync + 'static>(mut config: MemoryConfig) -> Arc<MemoryCache<T>> {
        // Keep the background timer from firing mid-test by default.
        config.auto_trim_interval = Duration::from_secs(3600);
        MemoryCache::new(config)
    }

    #[tokio::test]
    async fn get_and_set_round_trip() {
        let c: Arc<MemoryCache<String>> = cache(MemoryConfig::default());
        assert!(!c.contains("k"));
        c.set("k", "v".to_string(), 1);
        assert!(c.contains("k"));
        assert_eq!(*c.get("k").unwrap(), "v");
        c.shutdown().await;
    }

    #[tokio::test]
    async fn empty_key_is_a_no_op() {
        let c: Arc<MemoryCache<String>> = cache(MemoryConfig::default());
        c.set("", "v".to_string(), 1);
        assert!(!c.contains(""));
        assert!(c.get("").is_none());
        c.remove("");
        c.shutdown().await;
    }

    #[tokio::test]
    async fn count_limit_evicts_lru_tail() {
        let mut config = MemoryConfig::default();
        config.count_limit = 3;
        let c: Arc<MemoryCache<i32>> = cache(config);
        c.set("k1", 1, 1);
        c.set("k2", 2, 1);
        c.set("k3", 3, 1);
        c.set("k4", 4, 1);
        assert_eq!(c.total_count(), 3);
        assert!(c.get("k1").is_none());
        assert!(c.get("k2").is_some());
        assert!(c.get("k3").is_some());
        assert!(c.get("k4").is_some());

        // The three gets above left k4 at the head and k2 at the tail.
        // Touching k2 makes k3 the new tail, so inserting k5 evicts k3.
        c.get("k2");
        c.set("k5", 5, 1);
        assert!(c.get("k3").is_none());
        assert!(c.get("k2").is_some());
        assert!(c.get("k4").is_some());
        assert!(c.get("k5").is_some());
        c.shutdown().await;
    }

    #[tokio::test]
    async fn get_moves_key_to_head() {
        let c: Arc<MemoryCache<i32>> = cache(MemoryConfig::default());
        c.set("a", 1, 1);
        c.set("b", 2, 1);
        c.set("c", 3, 1);
        // Head is "c". Accessing "a" should move it to head, demoting "c" to
        // second-from-head.
        c.get("a");
        {
            let inner = c.inner.lock();
            let head_idx = inner.head.unwrap();
            assert_eq!(inner.node(head_idx).key, "a");
        }
        c.shutdown().await;
    }

    #[tokio::test]
    async fn cost_limit_trims_by_total_cost() {
        let mut config = MemoryConfig::default();
        config.cost_limit = 10;
        let c: Arc<MemoryCache<i32>> = cache(config);
        c.set("a", 1, 4);
        c.set("b", 2, 4);
        c.set("c", 3, 4);
        assert!(c.total_cost() <= 10);
        assert!(c.get("a").is_none());
        c.shutdown().await;
    }

    #[tokio::test]
    async fn trim_to_age_evicts_stale_entries() {
        let c: Arc<MemoryCache<i32>> = cache(MemoryConfig::default());
        c.set("k1", 1, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        c.trim_to_age(Duration::from_millis(10));
        assert!(c.get("k1").is_none());
        c.shutdown().await;
    }

    #[tokio::test]
    async fn remove_and_remove_all() {
        let c: Arc<MemoryCache<i32>> = cache(MemoryConfig::default());
        c.set("a", 1, 1);
        c.set("b", 2, 1);
        c.remove("a");
        assert!(c.get("a").is_none());
        assert!(c.get("b").is_some());
        c.remove_all();
        assert_eq!(c.total_count(), 0);
        assert_eq!(c.total_cost(), 0);
        assert!(c.get("b").is_none());
        c.shutdown().await;
    }

    #[tokio::test]
    async fn invariant_counts_match_structure() {
        let c: Arc<MemoryCache<i32>> = cache(MemoryConfig::default());
        for i in 0..50 {
            c.set(format!("k{i}"), i, 1);
        }
        let inner = c.inner.lock();
        assert_eq!(inner.total_count, inner.index.len() as u64);
        let mut walked = 0u64;
        let mut cur = inner.head;
        while let Some(idx) = cur {
            walked += 1;
            cur = inner.node(idx).next;
        }
        assert_eq!(walked, inner.total_count);
        drop(inner);
        c.shutdown().await;
    }
}
