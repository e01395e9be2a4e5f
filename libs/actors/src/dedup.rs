//! Admission Control
//!
//! Guarantees at most one in-flight delivery per message key. Keys live in
//! a fixed number of shards, each an insertion-ordered TTL map behind its own
//! async mutex, so concurrent producers only contend when their keys hash to
//! the same shard.
//!
//! A key is inserted by [`DedupCache::acquire`] and removed by
//! [`DedupCache::release`] once the owning worker has finished with it.
//! Keys that are never released (crashed or abandoned deliveries) expire
//! after the TTL. A full shard evicts its oldest key.

use bus_config::DedupConfig;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

#[derive(Debug)]
struct Shard {
    /// key -> insertion time
    entries: HashMap<String, Instant>,
    /// Insertion order, may hold stale keys already removed from `entries`
    order: VecDeque<(String, Instant)>,
}

impl Shard {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn purge_expired(&mut self, now: Instant, ttl: Duration) {
        while let Some((key, inserted)) = self.order.front() {
            if now.duration_since(*inserted) < ttl {
                break;
            }
            // Only drop the live entry if it is the same insertion
            if self.entries.get(key) == Some(inserted) {
                self.entries.remove(key);
            }
            self.order.pop_front();
        }
    }

    fn evict_oldest(&mut self) {
        while let Some((key, inserted)) = self.order.pop_front() {
            if self.entries.get(&key) == Some(&inserted) {
                self.entries.remove(&key);
                debug!(key = %key, "Dedup shard full, evicted oldest key");
                return;
            }
        }
    }

    fn compact(&mut self) {
        if self.order.len() > self.entries.len() * 2 + 64 {
            let entries = &self.entries;
            self.order
                .retain(|(key, inserted)| entries.get(key) == Some(inserted));
        }
    }
}

/// Sharded, TTL- and capacity-bounded set of in-flight keys
#[derive(Debug)]
pub struct DedupCache {
    shards: Vec<Mutex<Shard>>,
    capacity_per_shard: usize,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(config: &DedupConfig) -> Self {
        let shard_count = config.shards.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(Shard::new())).collect(),
            capacity_per_shard: config.capacity_per_shard.max(1),
            ttl: config.ttl(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Stable shard index for `key`
    pub fn shard_index(&self, key: &str) -> usize {
        crc32fast::hash(key.as_bytes()) as usize % self.shards.len()
    }

    /// Admit `key` if it is not already in flight
    pub async fn acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut shard = self.shards[self.shard_index(key)].lock().await;
        shard.purge_expired(now, self.ttl);

        if shard.entries.contains_key(key) {
            trace!(key, "Duplicate key rejected");
            return false;
        }

        if shard.entries.len() >= self.capacity_per_shard {
            shard.evict_oldest();
        }

        shard.entries.insert(key.to_string(), now);
        shard.order.push_back((key.to_string(), now));
        true
    }

    /// Forget `key`, allowing it to be admitted again
    pub async fn release(&self, key: &str) {
        let mut shard = self.shards[self.shard_index(key)].lock().await;
        shard.entries.remove(key);
        shard.compact();
    }

    /// Whether `key` is currently in flight
    pub async fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut shard = self.shards[self.shard_index(key)].lock().await;
        shard.purge_expired(now, self.ttl);
        shard.entries.contains_key(key)
    }

    /// Keys currently held across all shards
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let mut total = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().await;
            shard.purge_expired(now, self.ttl);
            total += shard.entries.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
