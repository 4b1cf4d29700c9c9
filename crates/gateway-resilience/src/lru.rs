//! Fixed-capacity least-recently-used map with per-entry expiry.
//!
//! Recency is a monotonically increasing tick; `order` maps tick to key so
//! the oldest entry is always the first key of the `BTreeMap`.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    expires_at: Instant,
    tick: u64,
}

/// LRU map used for the local cache tier
#[derive(Debug)]
pub struct LruMap<V> {
    capacity: usize,
    entries: HashMap<String, Slot<V>>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
    evictions: u64,
}

impl<V: Clone> LruMap<V> {
    /// Create a map holding at most `capacity` entries (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            evictions: 0,
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Read and mark as most recently used; expired entries are dropped
    pub fn get(&mut self, key: &str, now: Instant) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(slot) => slot.expires_at <= now,
            None => return None,
        };
        if expired {
            self.remove(key);
            return None;
        }

        let tick = self.bump();
        let slot = self.entries.get_mut(key)?;
        self.order.remove(&slot.tick);
        slot.tick = tick;
        self.order.insert(tick, key.to_string());
        Some(slot.value.clone())
    }

    /// Insert or replace, evicting the least recently used entry when full
    pub fn insert(&mut self, key: impl Into<String>, value: V, expires_at: Instant) {
        let key = key.into();
        self.remove(&key);

        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            self.evictions += 1;
        }

        let tick = self.bump();
        self.order.insert(tick, key.clone());
        self.entries.insert(
            key,
            Slot {
                value,
                expires_at,
                tick,
            },
        );
    }

    /// Remove an entry; returns whether it was present
    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.order.remove(&slot.tick);
                true
            }
            None => false,
        }
    }

    /// Entries currently held, including not yet collected expired ones
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries evicted for capacity so far
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
