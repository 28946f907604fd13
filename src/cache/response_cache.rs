//! Fingerprint-keyed LRU cache in front of the reasoning backend.
//!
//! Keys are opaque fingerprints (see [`fingerprint`]) derived from everything
//! that affects the backend's output. Values are opaque; when a value carries
//! a resource-cost record ([`CostRecord`]) a hit reports it as savings.
//!
//! Capacity is fixed at construction. A capacity `<= 0` means nothing is ever
//! stored. The enabled switch can be flipped at runtime: while disabled every
//! read misses and every write is dropped, but existing entries are kept for
//! when it is switched back on.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::CacheConfig;
use crate::telemetry::{CacheSavings, TurnTelemetry, LAYER_CLIENT};

/// Values that may remember what producing them cost.
pub trait CostRecord {
    /// Cost avoided when this value is served from cache.
    fn cost(&self) -> Option<CacheSavings> {
        None
    }
}

/// Fingerprint a request by hashing its JSON serialization.
///
/// Returns `None` if the request cannot be serialized; callers treat that as
/// "not cacheable" rather than an error.
pub fn fingerprint<T: Serialize + ?Sized>(request: &T) -> Option<String> {
    match serde_json::to_vec(request) {
        Ok(bytes) => Some(hex::encode(Sha256::digest(&bytes))),
        Err(e) => {
            debug!(error = %e, "Request not serializable, skipping cache");
            None
        }
    }
}

/// Point-in-time counters for one cache tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    /// Configured capacity (`<= 0` = writes disabled).
    pub capacity: i64,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups served from cache (0.0 when there were none).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, enabled: bool, capacity: i64, entries: usize) -> CacheStats {
        CacheStats {
            enabled,
            capacity,
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Convert a configured capacity into an LRU bound; `None` disables storage.
pub(crate) fn lru_capacity(capacity: i64) -> Option<NonZeroUsize> {
    usize::try_from(capacity).ok().and_then(NonZeroUsize::new)
}

/// Capacity-bounded LRU cache keyed by fingerprint.
pub struct ResponseCache<V> {
    /// `None` when capacity `<= 0`.
    entries: Mutex<Option<LruCache<String, V>>>,
    capacity: i64,
    enabled: AtomicBool,
    counters: Counters,
}

impl<V: Clone + CostRecord> ResponseCache<V> {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: i64, enabled: bool) -> Self {
        Self {
            entries: Mutex::new(lru_capacity(capacity).map(LruCache::new)),
            capacity,
            enabled: AtomicBool::new(enabled),
            counters: Counters::default(),
        }
    }

    /// Backend response cache as configured.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.client_max_entries, config.client_enabled)
    }

    /// Look up `key`. A hit promotes the entry to most-recently-used and is
    /// reported to `turn` together with the value's cost record.
    pub fn get(&self, key: &str, turn: &TurnTelemetry) -> Option<V> {
        if !self.is_enabled() {
            return None;
        }
        let value = {
            let mut guard = self.lock();
            guard.as_mut().and_then(|lru| lru.get(key).cloned())
        };
        match value {
            Some(value) => {
                self.counters.hit();
                debug!(layer = LAYER_CLIENT, key = %short(key), "Cache hit");
                turn.record_hit(LAYER_CLIENT, value.cost());
                Some(value)
            }
            None => {
                self.counters.miss();
                None
            }
        }
    }

    /// Insert or replace `key`, making it most-recently-used. Inserting a new
    /// key into a full cache evicts exactly the least-recently-used entry.
    pub fn set(&self, key: impl Into<String>, value: V) {
        if !self.is_enabled() {
            return;
        }
        let key = key.into();
        let mut guard = self.lock();
        let Some(lru) = guard.as_mut() else {
            return;
        };
        let replacing = lru.contains(key.as_str());
        if let Some((evicted, _)) = lru.push(key, value) {
            if !replacing {
                self.counters.eviction();
                debug!(layer = LAYER_CLIENT, key = %short(&evicted), "Evicting LRU cache entry");
            }
        }
    }

    /// Whether `key` is present, without promoting it.
    pub fn contains(&self, key: &str) -> bool {
        self.lock()
            .as_ref()
            .map(|lru| lru.contains(key))
            .unwrap_or(false)
    }

    /// Keys from most- to least-recently-used.
    pub fn keys(&self) -> Vec<String> {
        self.lock()
            .as_ref()
            .map(|lru| lru.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().as_ref().map(LruCache::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Flip the runtime switch. Entries survive a disable/enable cycle.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.len();
        self.counters
            .snapshot(self.is_enabled(), self.capacity, entries)
    }

    fn lock(&self) -> MutexGuard<'_, Option<LruCache<String, V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn short(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}
