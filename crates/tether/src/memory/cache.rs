//! In-process cache with a min-heap expiration queue and LRU eviction

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Serialize;

use crate::config::MemoryConfig;

/// Expiration queue node. Ordered by deadline, then insertion sequence.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapNode {
    expires_at: Instant,
    seq: u64,
    key: String,
}

struct Slot<V> {
    value: V,
    size_bytes: usize,
    expires_at: Instant,
    /// Sequence of the heap node that owns this slot
    seq: u64,
    /// Position in the LRU index
    tick: u64,
    access_count: u64,
    last_access_at: Instant,
}

/// Counters reported by [`MemoryCache::stats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub entries: usize,
    pub size_bytes: usize,
    pub max_size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl MemoryStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_size_bytes: usize,
    max_entries: usize,
}

struct Inner<V> {
    slots: HashMap<String, Slot<V>>,
    heap: BinaryHeap<Reverse<HeapNode>>,
    /// Access tick → key, oldest first
    lru: BTreeMap<u64, String>,
    next_seq: u64,
    next_tick: u64,
    size_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<V> Inner<V> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            heap: BinaryHeap::new(),
            lru: BTreeMap::new(),
            next_seq: 0,
            next_tick: 0,
            size_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Detach a slot from the map and LRU index. Its heap node goes stale.
    fn take(&mut self, key: &str) -> Option<Slot<V>> {
        let slot = self.slots.remove(key)?;
        self.lru.remove(&slot.tick);
        self.size_bytes -= slot.size_bytes;
        Some(slot)
    }

    fn touch(&mut self, key: &str, now: Instant) -> Option<&Slot<V>> {
        let tick = self.tick();
        let slot = self.slots.get_mut(key)?;
        self.lru.remove(&slot.tick);
        slot.tick = tick;
        slot.access_count += 1;
        slot.last_access_at = now;
        self.lru.insert(tick, key.to_string());
        self.slots.get(key)
    }

    fn lookup(&mut self, key: &str, now: Instant) -> Option<&Slot<V>> {
        match self.slots.get(key).map(|slot| slot.expires_at <= now) {
            None => {
                self.misses += 1;
                None
            }
            Some(true) => {
                self.take(key);
                self.expirations += 1;
                self.misses += 1;
                None
            }
            Some(false) => {
                self.hits += 1;
                self.touch(key, now)
            }
        }
    }

    /// Pop expired heap tops, skipping nodes superseded by a newer write
    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut purged = 0;

        while let Some(Reverse(node)) = self.heap.peek() {
            if node.expires_at > now {
                break;
            }
            let Some(Reverse(node)) = self.heap.pop() else {
                break;
            };
            let live = self
                .slots
                .get(&node.key)
                .is_some_and(|slot| slot.seq == node.seq);
            if live {
                self.take(&node.key);
                self.expirations += 1;
                purged += 1;
            }
        }

        purged
    }

    fn evict_lru(&mut self) -> bool {
        let Some((_, key)) = self.lru.pop_first() else {
            return false;
        };
        if let Some(slot) = self.slots.remove(&key) {
            self.size_bytes -= slot.size_bytes;
            self.evictions += 1;
            debug!("[MEMORY] Evicted {} ({} bytes)", key, slot.size_bytes);
        }
        true
    }

    /// Rebuild the heap once stale nodes outnumber live ones
    fn compact_heap(&mut self) {
        if self.heap.len() <= self.slots.len() * 2 + 64 {
            return;
        }
        let slots = &self.slots;
        self.heap.retain(|Reverse(node)| {
            slots.get(&node.key).is_some_and(|slot| slot.seq == node.seq)
        });
    }

    fn insert(
        &mut self,
        key: String,
        value: V,
        size_bytes: usize,
        ttl: Duration,
        now: Instant,
        limits: Limits,
    ) {
        self.take(&key);
        self.purge_expired(now);

        while self.size_bytes + size_bytes > limits.max_size_bytes
            || self.slots.len() >= limits.max_entries
        {
            if !self.evict_lru() {
                break;
            }
        }

        // Saturate far-future deadlines instead of overflowing
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365 * 100));

        self.next_seq += 1;
        let seq = self.next_seq;
        let tick = self.tick();

        self.heap.push(Reverse(HeapNode {
            expires_at,
            seq,
            key: key.clone(),
        }));
        self.lru.insert(tick, key.clone());
        self.size_bytes += size_bytes;
        self.slots.insert(
            key,
            Slot {
                value,
                size_bytes,
                expires_at,
                seq,
                tick,
                access_count: 0,
                last_access_at: now,
            },
        );

        self.compact_heap();
    }
}

/// Bounded in-memory cache
///
/// Entries are sized by their serialized JSON footprint. Every operation,
/// reads included, runs under a single lock.
pub struct MemoryCache<V> {
    inner: Mutex<Inner<V>>,
    limits: Limits,
    default_ttl: Duration,
}

impl<V: Clone + Serialize> MemoryCache<V> {
    pub fn new(max_size_bytes: usize, max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            limits: Limits {
                max_size_bytes,
                max_entries: max_entries.max(1),
            },
            default_ttl,
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(
            config.max_size_bytes,
            config.max_entries,
            config.default_ttl(),
        )
    }

    fn size_of(key: &str, value: &V) -> Option<usize> {
        match serde_json::to_vec(value) {
            Ok(bytes) => Some(bytes.len()),
            Err(e) => {
                warn!("[MEMORY] Cannot size value for {}: {}", key, e);
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .lookup(key, Instant::now())
            .map(|slot| slot.value.clone())
    }

    /// Insert or replace a value. `ttl` of None uses the cache default.
    ///
    /// Returns false if the value is larger than the whole cache budget.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> bool {
        let Some(size) = Self::size_of(key, &value) else {
            return false;
        };
        if size > self.limits.max_size_bytes {
            warn!(
                "[MEMORY] Rejected {}: {} bytes exceeds the {} byte budget",
                key, size, self.limits.max_size_bytes
            );
            return false;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.insert(
            key.to_string(),
            value,
            size,
            ttl.unwrap_or(self.default_ttl),
            Instant::now(),
            self.limits,
        );
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().unwrap().take(key).is_some()
    }

    /// Presence check that honors expiry without counting as an access
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .unwrap()
            .slots
            .get(key)
            .is_some_and(|slot| slot.expires_at > now)
    }

    pub fn clear(&self) {
        *self.inner.lock().unwrap() = Inner::new();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up several keys at once; misses are absent from the result
    pub fn batch_get(&self, keys: &[&str]) -> HashMap<String, V> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        keys.iter()
            .filter_map(|key| {
                inner
                    .lookup(key, now)
                    .map(|slot| (key.to_string(), slot.value.clone()))
            })
            .collect()
    }

    /// Insert several values at once, returning how many were stored
    pub fn batch_set(&self, entries: Vec<(String, V)>, ttl: Option<Duration>) -> usize {
        let sized: Vec<_> = entries
            .into_iter()
            .filter_map(|(key, value)| {
                let size = Self::size_of(&key, &value)?;
                (size <= self.limits.max_size_bytes).then_some((key, value, size))
            })
            .collect();

        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let stored = sized.len();

        for (key, value, size) in sized {
            inner.insert(key, value, size, ttl, now, self.limits);
        }

        stored
    }

    /// Drop every expired entry, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let purged = self.inner.lock().unwrap().purge_expired(Instant::now());
        if purged > 0 {
            debug!("[MEMORY] Expired {} entries", purged);
        }
        purged
    }

    /// Access count and idle time for a live entry
    pub fn access_info(&self, key: &str) -> Option<(u64, Duration)> {
        let inner = self.inner.lock().unwrap();
        let slot = inner.slots.get(key)?;
        Some((slot.access_count, slot.last_access_at.elapsed()))
    }

    pub fn stats(&self) -> MemoryStats {
        let inner = self.inner.lock().unwrap();
        MemoryStats {
            entries: inner.slots.len(),
            size_bytes: inner.size_bytes,
            max_size_bytes: self.limits.max_size_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
        }
    }
}
