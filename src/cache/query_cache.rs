//! Revision-stamped cache in front of the event query.
//!
//! Every successful store mutation calls [`QueryResultCache::invalidate`],
//! which bumps the revision and clears the map in one critical section.
//! Keys carry the revision they were computed at, so an entry from an older
//! revision can never be constructed by a lookup again. Clearing on every
//! mutation is deliberately coarse: no stale read is possible, at the cost of
//! dropping unrelated ranges.
//!
//! Range boundaries are normalized (explicit offset, second precision)
//! before they become part of a key, so `2026-02-10T00:00` and
//! `2026-02-10T00:00:00+01:00` share an entry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::FixedOffset;
use lru::LruCache;
use tracing::debug;

use super::response_cache::{lru_capacity, CacheStats, Counters};
use crate::config::CacheConfig;
use crate::telemetry::{TurnTelemetry, LAYER_TOOL};
use crate::timeparse;

/// `(start, end, revision)` with normalized boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub start: String,
    pub end: String,
    pub revision: u64,
}

/// Outcome of [`QueryResultCache::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryLookup {
    Hit(String),
    /// Compute the result, then hand it back with [`QueryResultCache::complete`].
    Miss(QueryKey),
}

struct QueryState {
    revision: u64,
    /// `None` when capacity `<= 0`.
    entries: Option<LruCache<QueryKey, String>>,
}

/// Query result cache plus the store revision counter it is keyed on.
pub struct QueryResultCache {
    state: Mutex<QueryState>,
    capacity: i64,
    enabled: AtomicBool,
    tz: FixedOffset,
    counters: Counters,
}

impl QueryResultCache {
    /// Revision starts at 0.
    pub fn new(capacity: i64, enabled: bool, tz: FixedOffset) -> Self {
        Self {
            state: Mutex::new(QueryState {
                revision: 0,
                entries: lru_capacity(capacity).map(LruCache::new),
            }),
            capacity,
            enabled: AtomicBool::new(enabled),
            tz,
            counters: Counters::default(),
        }
    }

    pub fn from_config(config: &CacheConfig, tz: FixedOffset) -> Self {
        Self::new(config.tool_max_entries, config.tool_enabled, tz)
    }

    /// Current store revision.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Record a committed mutation: bump the revision and drop every entry.
    ///
    /// Runs whether or not caching is enabled so the revision always tracks
    /// the store. Returns the new revision.
    pub fn invalidate(&self) -> u64 {
        let mut state = self.lock();
        state.revision += 1;
        if let Some(entries) = state.entries.as_mut() {
            entries.clear();
        }
        debug!(revision = state.revision, "Query cache invalidated");
        state.revision
    }

    /// Look up `(start, end)` at the current revision.
    pub fn lookup(&self, start: &str, end: &str, turn: &TurnTelemetry) -> Option<String> {
        match self.begin(start, end, turn) {
            QueryLookup::Hit(value) => Some(value),
            QueryLookup::Miss(_) => None,
        }
    }

    /// Store `value` under the revision current at the time of the call.
    ///
    /// A result whose computation overlapped a mutation lands at the new
    /// revision. Call sites that cannot accept that use [`begin`] and
    /// [`complete`] instead.
    ///
    /// [`begin`]: Self::begin
    /// [`complete`]: Self::complete
    pub fn store(&self, start: &str, end: &str, value: impl Into<String>) {
        if !self.is_enabled() {
            return;
        }
        let (start, end) = self.normalize(start, end);
        let mut state = self.lock();
        let key = QueryKey {
            start,
            end,
            revision: state.revision,
        };
        Self::insert(&mut state, key, value.into(), &self.counters);
    }

    /// Look up `(start, end)`; on a miss, return the key (with the revision
    /// snapshot) the result must be stored under.
    pub fn begin(&self, start: &str, end: &str, turn: &TurnTelemetry) -> QueryLookup {
        let (start, end) = self.normalize(start, end);
        let mut state = self.lock();
        let key = QueryKey {
            start,
            end,
            revision: state.revision,
        };
        if !self.is_enabled() {
            return QueryLookup::Miss(key);
        }
        let hit = state
            .entries
            .as_mut()
            .and_then(|entries| entries.get(&key).cloned());
        drop(state);

        match hit {
            Some(value) => {
                self.counters.hit();
                debug!(start = %key.start, end = %key.end, revision = key.revision, "Query cache hit");
                turn.record_hit(LAYER_TOOL, None);
                QueryLookup::Hit(value)
            }
            None => {
                self.counters.miss();
                QueryLookup::Miss(key)
            }
        }
    }

    /// Store a result computed after [`begin`](Self::begin) returned `key`.
    ///
    /// Dropped (returns `false`) if a mutation committed in between, since
    /// the result may predate it.
    pub fn complete(&self, key: QueryKey, value: impl Into<String>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut state = self.lock();
        if state.revision != key.revision {
            debug!(
                stale = key.revision,
                current = state.revision,
                "Discarding query result computed across a mutation"
            );
            return false;
        }
        Self::insert(&mut state, key, value.into(), &self.counters)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.as_ref().map(LruCache::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Flip the runtime switch. Revision tracking continues while disabled.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.len();
        self.counters
            .snapshot(self.is_enabled(), self.capacity, entries)
    }

    fn insert(state: &mut QueryState, key: QueryKey, value: String, counters: &Counters) -> bool {
        let Some(entries) = state.entries.as_mut() else {
            return false;
        };
        let replacing = entries.contains(&key);
        if entries.push(key, value).is_some() && !replacing {
            counters.eviction();
        }
        true
    }

    fn normalize(&self, start: &str, end: &str) -> (String, String) {
        (
            timeparse::normalize_boundary(start, self.tz),
            timeparse::normalize_boundary(end, self.tz),
        )
    }

    fn lock(&self) -> MutexGuard<'_, QueryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for QueryResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResultCache")
            .field("revision", &self.revision())
            .field("entries", &self.len())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
