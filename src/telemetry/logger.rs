//! Bounded structured event log and derived aggregates.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;
use crate::breaker::{BreakerEvent, BreakerObserver};

/// `tier` metadata of a fallback event recording one failed alternate.
pub const ATTEMPT_TIER: &str = "provider_attempt";

/// What an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// One attempt against a provider.
    ProviderCall,
    /// A retry was scheduled.
    Retry,
    /// A breaker changed state (`from`/`to` in metadata).
    CircuitBreakerStateChange,
    /// A breaker recorded a failure.
    CircuitBreakerFailure,
    /// A fallback tier was used (`tier`, `fallback_provider` in metadata).
    /// Failed alternates inside a walk carry tier [`ATTEMPT_TIER`].
    Fallback,
    CacheHit,
    CacheMiss,
    Timeout,
    /// The sanitize layer rejected or redacted content.
    Sanitize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Success,
    Failure,
    Info,
}

/// One structured telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub status: EventStatus,
    pub provider: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TelemetryEvent {
    /// Create an event stamped now.
    pub fn new(kind: EventKind, status: EventStatus, provider: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            provider: provider.into(),
            timestamp: Utc::now(),
            duration_ms: None,
            operation: None,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// String metadata value for `key`.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Whether this is a fallback event for one alternate inside a walk
    /// rather than the walk's final outcome.
    pub fn is_fallback_attempt(&self) -> bool {
        self.kind == EventKind::Fallback && self.meta_str("tier") == Some(ATTEMPT_TIER)
    }
}

/// Inclusive time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window covering the last `window` up to now.
    pub fn last(window: Duration) -> Self {
        let end = Utc::now();
        let span = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let start = end.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// Per-provider call statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    /// Successes / calls, 0.0–1.0. Zero when no calls were seen.
    pub success_rate: f64,
    pub average_latency_ms: f64,
}

/// Metrics derived from a set of events.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateMetrics {
    pub total_events: u64,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Successful / total calls, 0.0–1.0.
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub retries: u64,
    pub fallbacks: u64,
    pub timeouts: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Transitions into `open`.
    pub breaker_trips: u64,
    pub per_provider: BTreeMap<String, ProviderStats>,
    /// Provider calls per operation kind.
    pub by_operation: BTreeMap<String, u64>,
    /// Failed calls per error category.
    pub errors_by_category: BTreeMap<String, u64>,
}

impl AggregateMetrics {
    /// Aggregate `events`.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a TelemetryEvent>) -> Self {
        let mut agg = AggregateMetrics::default();
        let mut latency_sum = 0u64;
        let mut latency_count = 0u64;
        let mut provider_latency: BTreeMap<String, (u64, u64)> = BTreeMap::new();

        for event in events {
            agg.total_events += 1;
            match event.kind {
                EventKind::ProviderCall => {
                    agg.total_calls += 1;
                    let stats = agg.per_provider.entry(event.provider.clone()).or_default();
                    stats.calls += 1;
                    if event.status == EventStatus::Failure {
                        agg.failed_calls += 1;
                        stats.failures += 1;
                        let category = event.meta_str("category").unwrap_or("unknown");
                        *agg.errors_by_category.entry(category.to_string()).or_default() += 1;
                    } else {
                        agg.successful_calls += 1;
                        stats.successes += 1;
                    }
                    if let Some(ms) = event.duration_ms {
                        latency_sum += ms;
                        latency_count += 1;
                        let entry = provider_latency.entry(event.provider.clone()).or_default();
                        entry.0 += ms;
                        entry.1 += 1;
                    }
                    if let Some(op) = &event.operation {
                        *agg.by_operation.entry(op.clone()).or_default() += 1;
                    }
                }
                EventKind::Retry => agg.retries += 1,
                EventKind::Fallback if !event.is_fallback_attempt() => agg.fallbacks += 1,
                EventKind::Fallback => {}
                EventKind::Timeout => agg.timeouts += 1,
                EventKind::CacheHit => agg.cache_hits += 1,
                EventKind::CacheMiss => agg.cache_misses += 1,
                EventKind::CircuitBreakerStateChange => {
                    if event.meta_str("to") == Some("open") {
                        agg.breaker_trips += 1;
                    }
                }
                EventKind::CircuitBreakerFailure | EventKind::Sanitize => {}
            }
        }

        agg.success_rate = ratio(agg.successful_calls, agg.total_calls);
        agg.average_latency_ms = mean(latency_sum, latency_count);
        for (provider, stats) in agg.per_provider.iter_mut() {
            stats.success_rate = ratio(stats.successes, stats.calls);
            if let Some((sum, count)) = provider_latency.get(provider) {
                stats.average_latency_ms = mean(*sum, *count);
            }
        }
        agg
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn mean(sum: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

/// Time-windowed view of the log.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub events: Vec<TelemetryEvent>,
    pub aggregate: AggregateMetrics,
    /// Events evicted from the ring buffer since creation (or last clear).
    pub evicted: u64,
}

/// Configuration for the telemetry log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Ring buffer capacity. Default: 10,000.
    pub max_events: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { max_events: 10_000 }
    }
}

impl TelemetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }
}

/// Append-only, bounded, shareable event log.
///
/// When full, the oldest event is evicted for each new one.
pub struct TelemetryLogger {
    capacity: usize,
    events: Mutex<VecDeque<TelemetryEvent>>,
    evicted: AtomicU64,
}

impl Default for TelemetryLogger {
    fn default() -> Self {
        Self::new(&TelemetryConfig::default())
    }
}

impl TelemetryLogger {
    pub fn new(config: &TelemetryConfig) -> Self {
        let capacity = config.max_events.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an event, evicting the oldest if the log is full.
    pub fn log_event(&self, event: TelemetryEvent) {
        debug!(
            kind = ?event.kind,
            status = ?event.status,
            provider = %event.provider,
            duration_ms = event.duration_ms,
            error = event.error.as_deref(),
            "telemetry event"
        );
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
    }

    /// Events (in insertion order) and aggregates, optionally limited to `range`.
    pub fn snapshot(&self, range: Option<TimeRange>) -> TelemetrySnapshot {
        let events = self.events_in(range);
        let aggregate = AggregateMetrics::from_events(&events);
        TelemetrySnapshot {
            events,
            aggregate,
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Events within `range` (all events when `None`).
    pub fn events_in(&self, range: Option<TimeRange>) -> Vec<TelemetryEvent> {
        let events = self.events.lock();
        match range {
            Some(range) => events
                .iter()
                .filter(|e| range.contains(e.timestamp))
                .cloned()
                .collect(),
            None => events.iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all events and reset the eviction counter.
    pub fn clear(&self) {
        self.events.lock().clear();
        self.evicted.store(0, Ordering::Relaxed);
    }

    /// Full snapshot as pretty JSON.
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot(None))?)
    }
}

impl BreakerObserver for TelemetryLogger {
    fn on_breaker_event(&self, event: &BreakerEvent) {
        let record = match event {
            BreakerEvent::StateChanged {
                provider,
                from,
                to,
                at,
            } => TelemetryEvent::new(EventKind::CircuitBreakerStateChange, EventStatus::Info, provider)
                .at(*at)
                .meta("from", from.as_str())
                .meta("to", to.as_str()),
            BreakerEvent::Failure {
                provider,
                error,
                consecutive_failures,
                failure_rate,
                at,
            } => TelemetryEvent::new(EventKind::CircuitBreakerFailure, EventStatus::Failure, provider)
                .at(*at)
                .error(error)
                .meta("consecutive_failures", *consecutive_failures)
                .meta("failure_rate", *failure_rate),
        };
        self.log_event(record);
    }
}

impl std::fmt::Debug for TelemetryLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryLogger")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(provider: &str, ok: bool, ms: u64) -> TelemetryEvent {
        let status = if ok {
            EventStatus::Success
        } else {
            EventStatus::Failure
        };
        TelemetryEvent::new(EventKind::ProviderCall, status, provider)
            .duration(Duration::from_millis(ms))
            .operation("generate")
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let logger = TelemetryLogger::new(&TelemetryConfig::new().max_events(2));
        logger.log_event(call("a", true, 1));
        logger.log_event(call("b", true, 1));
        logger.log_event(call("c", true, 1));
        let snapshot = logger.snapshot(None);
        let providers: Vec<_> = snapshot.events.iter().map(|e| e.provider.as_str()).collect();
        assert_eq!(providers, vec!["b", "c"]);
        assert_eq!(snapshot.evicted, 1);
    }

    #[test]
    fn aggregates_per_provider() {
        let events = vec![
            call("a", true, 100),
            call("a", false, 300).meta("category", "rate_limit"),
            call("b", true, 50),
        ];
        let agg = AggregateMetrics::from_events(&events);
        assert_eq!(agg.total_calls, 3);
        assert_eq!(agg.failed_calls, 1);
        assert_eq!(agg.per_provider["a"].calls, 2);
        assert!((agg.per_provider["a"].success_rate - 0.5).abs() < f64::EPSILON);
        assert!((agg.per_provider["a"].average_latency_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(agg.errors_by_category["rate_limit"], 1);
        assert_eq!(agg.by_operation["generate"], 3);
    }

    #[test]
    fn empty_aggregate_has_zero_rates() {
        let agg = AggregateMetrics::from_events(&[]);
        assert_eq!(agg.success_rate, 0.0);
        assert_eq!(agg.average_latency_ms, 0.0);
    }

    #[test]
    fn snapshot_filters_by_range() {
        let logger = TelemetryLogger::default();
        let old = Utc::now() - chrono::Duration::hours(2);
        logger.log_event(call("a", true, 1).at(old));
        logger.log_event(call("b", true, 1));
        let recent = logger.snapshot(Some(TimeRange::last(Duration::from_secs(3600))));
        assert_eq!(recent.events.len(), 1);
        assert_eq!(recent.events[0].provider, "b");
    }
}
