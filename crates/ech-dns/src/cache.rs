//! TTL-bounded 2Q cache for resolver lookups.
//!
//! Keys are `(name, qtype)`. Each entry owns an async lock so concurrent
//! lookups for the same key serialize on the entry and only the first one
//! performs the network round-trip. Admission follows the 2Q scheme: new
//! keys enter a probationary FIFO and are promoted to the main LRU queue on
//! re-reference, which keeps one-shot lookups from flushing hot entries.
//!
//! Expiry is measured on `tokio::time::Instant`, so tests can drive the
//! clock with `tokio::time::pause`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::message::RData;

/// Default capacity, overridable via `ECH_DNS_CACHE_SIZE`.
const DEFAULT_CAPACITY: usize = 32;
/// Default negative TTL in seconds, overridable via
/// `ECH_DNS_NEGATIVE_TTL_S`.
const DEFAULT_NEGATIVE_TTL_S: u64 = 300;

pub(crate) type CacheKey = (String, u16);

/// A cached lookup outcome.
#[derive(Debug, Clone)]
pub(crate) enum CacheValue {
    /// Decoded answers; empty answers are cached too (for the negative
    /// TTL).
    Records(Vec<RData>),
    /// The name does not exist.
    NxDomain,
}

#[derive(Debug)]
pub(crate) struct SlotState {
    pub value: Option<CacheValue>,
    pub expires_at: Instant,
}

/// One cache entry. The async lock provides the per-key single flight.
#[derive(Debug)]
pub(crate) struct CacheSlot {
    pub lock: tokio::sync::Mutex<SlotState>,
}

pub(crate) struct DnsCache {
    state: Mutex<CacheState>,
    negative_ttl: Duration,
}

struct CacheState {
    capacity: usize,
    slots: HashMap<CacheKey, Arc<CacheSlot>>,
    /// A1in: keys seen once, FIFO order.
    probation: VecDeque<CacheKey>,
    /// Am: keys referenced again, LRU order (front is coldest).
    main: VecDeque<CacheKey>,
}

impl DnsCache {
    pub fn new() -> Self {
        let capacity = std::env::var("ECH_DNS_CACHE_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_CAPACITY);
        let negative_ttl = Duration::from_secs(
            std::env::var("ECH_DNS_NEGATIVE_TTL_S")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_NEGATIVE_TTL_S),
        );
        Self {
            state: Mutex::new(CacheState {
                capacity,
                slots: HashMap::new(),
                probation: VecDeque::new(),
                main: VecDeque::new(),
            }),
            negative_ttl,
        }
    }

    pub fn negative_ttl(&self) -> Duration {
        self.negative_ttl
    }

    /// Resizes the cache; 0 disables caching entirely.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = match self.state.lock() {
            Ok(g) => g,
            Err(_) => {
                tracing::error!(target: "ech_dns::cache", "cache lock poisoned on set_capacity");
                return;
            }
        };
        state.capacity = capacity;
        if capacity == 0 {
            state.slots.clear();
            state.probation.clear();
            state.main.clear();
            return;
        }
        while state.slots.len() > state.capacity {
            state.evict_one();
        }
    }

    /// Returns the entry for `key`, creating it if needed; `None` when
    /// caching is disabled. Touching an existing key promotes it.
    pub fn slot(&self, key: &CacheKey) -> Option<Arc<CacheSlot>> {
        let mut state = match self.state.lock() {
            Ok(g) => g,
            Err(_) => {
                tracing::error!(target: "ech_dns::cache", "cache lock poisoned on slot");
                return None;
            }
        };
        if state.capacity == 0 {
            return None;
        }
        if let Some(slot) = state.slots.get(key).cloned() {
            state.touch(key);
            return Some(slot);
        }
        let slot = Arc::new(CacheSlot {
            lock: tokio::sync::Mutex::new(SlotState {
                value: None,
                expires_at: Instant::now(),
            }),
        });
        state.slots.insert(key.clone(), slot.clone());
        state.probation.push_back(key.clone());
        while state.slots.len() > state.capacity {
            state.evict_one();
        }
        Some(slot)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().map(|s| s.slots.len()).unwrap_or(0)
    }
}

impl CacheState {
    fn touch(&mut self, key: &CacheKey) {
        if let Some(i) = self.main.iter().position(|k| k == key) {
            let k = self.main.remove(i).expect("position just found");
            self.main.push_back(k);
        } else if let Some(i) = self.probation.iter().position(|k| k == key) {
            let k = self.probation.remove(i).expect("position just found");
            self.main.push_back(k);
        }
    }

    /// Evicts the oldest probationary key, falling back to the main LRU
    /// tail.
    fn evict_one(&mut self) {
        let victim = self.probation.pop_front().or_else(|| self.main.pop_front());
        if let Some(key) = victim {
            self.slots.remove(&key);
            tracing::debug!(target: "ech_dns::cache", name = %key.0, qtype = key.1, "evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CacheKey {
        (name.to_string(), 1)
    }

    #[tokio::test]
    async fn slot_is_stable_for_a_key() {
        let cache = DnsCache::new();
        cache.set_capacity(4);
        let a = cache.slot(&key("a")).unwrap();
        let b = cache.slot(&key("a")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn capacity_zero_disables() {
        let cache = DnsCache::new();
        cache.set_capacity(0);
        assert!(cache.slot(&key("a")).is_none());
    }

    #[tokio::test]
    async fn one_shot_keys_evicted_before_hot_keys() {
        let cache = DnsCache::new();
        cache.set_capacity(4);
        let hot = cache.slot(&key("hot")).unwrap();
        cache.slot(&key("hot")).unwrap(); // promote to main

        for name in ["b", "c", "d", "e", "f"] {
            cache.slot(&key(name)).unwrap();
        }
        assert_eq!(cache.len(), 4);
        // The hot key survived the one-shot churn.
        let again = cache.slot(&key("hot")).unwrap();
        assert!(Arc::ptr_eq(&hot, &again));
    }

    #[tokio::test]
    async fn shrinking_evicts() {
        let cache = DnsCache::new();
        cache.set_capacity(8);
        for name in ["a", "b", "c", "d", "e"] {
            cache.slot(&key(name)).unwrap();
        }
        cache.set_capacity(2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn single_flight_serializes_on_entry_lock() {
        let cache = Arc::new(DnsCache::new());
        cache.set_capacity(4);
        let slot = cache.slot(&key("a")).unwrap();
        let guard = slot.lock.lock().await;

        let cache2 = cache.clone();
        let waiter = tokio::spawn(async move {
            let slot = cache2.slot(&key("a")).unwrap();
            let state = slot.lock.lock().await;
            state.value.is_some()
        });
        // The waiter cannot proceed until the first lookup stores a value.
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let mut state = guard;
        state.value = Some(CacheValue::Records(Vec::new()));
        state.expires_at = Instant::now() + Duration::from_secs(60);
        drop(state);
        assert!(waiter.await.unwrap());
    }
}
