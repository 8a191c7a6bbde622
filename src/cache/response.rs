//! TTL + capacity-bounded response cache.
//!
//! Backed by moka's concurrent cache for storage and capacity eviction.
//! Expiry is tracked per entry against `tokio::time::Instant`, so paused-time
//! tests can step past it deterministically.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::notification::RemovalCause;
use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::providers::CacheKey;
use crate::telemetry;
use crate::types::GenerateResponse;

/// Configuration for the response cache.
///
/// ```rust
/// # use palisade::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(10_000)
///     .ttl(Duration::from_secs(3600));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of cached entries. Default: 10,000.
    pub max_entries: u64,
    /// Default time-to-live for entries. Default: 1 hour.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of cached entries.
    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the default time-to-live.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// One cached result. Immutable; a re-`set` replaces it wholesale.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: GenerateResponse,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    /// Expired strictly after `expires_at`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// Time since the entry was written.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped to stay within `max_entries`.
    pub evictions: u64,
    /// Entries purged after expiry.
    pub expirations: u64,
    /// Live (unexpired) entries.
    pub size: u64,
    /// hits / (hits + misses), 0.0 when nothing was looked up.
    pub hit_rate: f64,
}

/// In-memory, concurrency-safe response cache.
pub struct ResponseCache {
    entries: Cache<CacheKey, Arc<CacheEntry>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: Arc<AtomicU64>,
    expirations: AtomicU64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl ResponseCache {
    /// Create a cache with the given configuration.
    pub fn new(config: &CacheConfig) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let listener_evictions = Arc::clone(&evictions);
        let entries = Cache::builder()
            .max_capacity(config.max_entries)
            .eviction_listener(move |_key, _value, cause| {
                if cause == RemovalCause::Size {
                    listener_evictions.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "cause" => "capacity")
                        .increment(1);
                }
            })
            .build();
        Self {
            entries,
            default_ttl: config.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions,
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up a cached value. Expired entries read as absent.
    pub fn get(&self, key: &CacheKey) -> Option<GenerateResponse> {
        self.get_entry(key).map(|entry| entry.value.clone())
    }

    /// Look up the full entry, including its timestamps.
    pub fn get_entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let found = self.entries.get(key).and_then(|entry| {
            if entry.is_expired_at(Instant::now()) {
                self.purge_expired(key, &entry);
                None
            } else {
                Some(entry)
            }
        });

        match found {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                None
            }
        }
    }

    /// Insert (or replace) a value. `ttl` overrides the default TTL.
    pub fn set(&self, key: CacheKey, value: GenerateResponse, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry {
            key: key.clone(),
            value,
            created_at: now,
            expires_at: now + ttl,
        };
        debug!(%key, ttl_ms = ttl.as_millis() as u64, "cache set");
        self.entries.insert(key, Arc::new(entry));
    }

    /// Remove an entry. Returns whether one was present.
    pub fn delete(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry. Counters are kept.
    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    /// Purge every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(Arc<CacheKey>, Arc<CacheEntry>)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .collect();
        expired
            .iter()
            .filter(|(key, entry)| self.purge_expired(key, entry))
            .count()
    }

    /// Current counters. Sweeps expired entries first so `size` counts live
    /// entries only.
    pub fn stats(&self) -> CacheStats {
        self.sweep();
        self.entries.run_pending_tasks();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            size: self.entries.entry_count(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Remove `key` only while it still maps to `stale`. A concurrent `set`
    /// that replaced the entry wins.
    fn purge_expired(&self, key: &CacheKey, stale: &Arc<CacheEntry>) -> bool {
        let result = self
            .entries
            .entry_by_ref(key)
            .and_compute_with(|current| match current {
                Some(current) if Arc::ptr_eq(current.value(), stale) => Op::Remove,
                _ => Op::Nop,
            });
        if !matches!(result, CompResult::Removed(_)) {
            return false;
        }
        self.expirations.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "cause" => "expired").increment(1);
        true
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("default_ttl", &self.default_ttl)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}
