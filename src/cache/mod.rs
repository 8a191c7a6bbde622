//! Response cache.
//!
//! [`ResponseCache`] stores prior successful generation results keyed by
//! [`CacheKey`](crate::providers::CacheKey). It serves two purposes:
//! skipping repeat calls, and acting as the degraded-mode tier of the
//! fallback layer when providers are failing.
//!
//! Entries carry their own expiry. Expired entries read as absent and are
//! purged lazily on read, or in bulk by [`ResponseCache::sweep`], so they
//! never count toward size or hit statistics.

pub mod response;

pub use response::{CacheConfig, CacheEntry, CacheStats, ResponseCache};
