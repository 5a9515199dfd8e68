//! Counters for what the cache has been doing.
//!
//! Workers and callers update these concurrently, so they live in atomics; [CacheStats] is a plain snapshot.
use std::sync::atomic::{AtomicU64, Ordering};

/// A point-in-time view of the cache counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the store.
    pub hits: u64,
    /// Lookups which weren't, whether or not they started a fetch.
    pub misses: u64,
    /// Fetch tasks handed to the worker pool.
    pub fetches_started: u64,
    /// Misses which attached to an already running fetch instead of starting one.
    pub fetches_joined: u64,
    pub fetch_failures: u64,
    pub decode_failures: u64,
    /// Entries pushed out of the store by newer ones.
    pub evictions: u64,
    /// Entries in the store when the snapshot was taken.
    pub entries: usize,
}

impl CacheStats {
    /// hits / (hits + misses), or 0 if nothing was looked up yet.
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
pub(crate) struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches_started: AtomicU64,
    fetches_joined: AtomicU64,
    fetch_failures: AtomicU64,
    decode_failures: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_started(&self) {
        self.fetches_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_joined(&self) {
        self.fetches_joined.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// The store owns the eviction and entry counts, so the caller passes them in.
    pub(crate) fn snapshot(&self, evictions: u64, entries: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches_started: self.fetches_started.load(Ordering::Relaxed),
            fetches_joined: self.fetches_joined.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            evictions,
            entries,
        }
    }
}
