//! Telemetry: structured event log, aggregates, health scoring, and
//! metric name constants.
//!
//! Two complementary outputs:
//!
//! - An in-process [`TelemetryLogger`]: a bounded ring buffer of
//!   [`TelemetryEvent`]s from which [`TelemetrySnapshot`]s, aggregate
//!   metrics and [`HealthScorer`] results are derived on demand. Nothing is
//!   persisted beyond the process.
//! - `metrics` crate counters and histograms named by the constants below.
//!   Consumers install their own recorder (prometheus, statsd, …); without
//!   one, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `palisade_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `provider`: provider id
//! - `operation`: operation kind (e.g. "generate", "insight")
//! - `status`: "ok" or "error"
//! - `category`: error category from the classifier

mod health;
mod logger;

pub use health::{FallbackStats, HealthScorer, HealthWeights, ProviderHealth, StateTransition};
pub use logger::{
    ATTEMPT_TIER, AggregateMetrics, EventKind, EventStatus, ProviderStats, TelemetryConfig,
    TelemetryEvent, TelemetryLogger, TelemetrySnapshot, TimeRange,
};

/// Provider calls observed by the telemetry layer.
///
/// Labels: `provider`, `operation`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "palisade_requests_total";

/// Provider call duration in seconds.
///
/// Labels: `provider`, `operation`.
pub const REQUEST_DURATION_SECONDS: &str = "palisade_request_duration_seconds";

/// Retry attempts scheduled (not counting the initial request).
///
/// Labels: `provider`, `category`.
pub const RETRIES_TOTAL: &str = "palisade_retries_total";

/// Circuit breaker state transitions.
///
/// Labels: `provider`, `to`.
pub const BREAKER_TRANSITIONS_TOTAL: &str = "palisade_breaker_transitions_total";

/// Calls rejected by an open breaker.
///
/// Labels: `provider`.
pub const BREAKER_REJECTIONS_TOTAL: &str = "palisade_breaker_rejections_total";

/// Fallback tier activations.
///
/// Labels: `tier` ("provider" | "cache").
pub const FALLBACKS_TOTAL: &str = "palisade_fallbacks_total";

/// Timeouts fired by the timeout layer.
///
/// Labels: `provider`.
pub const TIMEOUTS_TOTAL: &str = "palisade_timeouts_total";

/// Response cache hits.
pub const CACHE_HITS_TOTAL: &str = "palisade_cache_hits_total";

/// Response cache misses (including expired entries).
pub const CACHE_MISSES_TOTAL: &str = "palisade_cache_misses_total";

/// Response cache entries removed for capacity or expiry.
///
/// Labels: `cause` ("capacity" | "expired").
pub const CACHE_EVICTIONS_TOTAL: &str = "palisade_cache_evictions_total";

/// Requests or responses rejected by the sanitize layer.
///
/// Labels: `kind`.
pub const SANITIZE_REJECTIONS_TOTAL: &str = "palisade_sanitize_rejections_total";

/// Redactions applied to responses.
pub const REDACTIONS_TOTAL: &str = "palisade_redactions_total";
