//! Provider health scoring over a telemetry window.
//!
//! Health is derived, never stored: every query slices the event log to the
//! requested window and recomputes.
//!
//! | component        | input                                          | 100 when            |
//! |------------------|------------------------------------------------|---------------------|
//! | success          | successful / total provider calls              | every call succeeds |
//! | latency          | mean call latency vs. `latency_target`         | mean ≤ target       |
//! | breaker trips    | transitions into `open`                        | no trips            |
//! | recovery         | half-open episodes ending closed               | every probe run recovers |
//!
//! Components with no data in the window score 100.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::logger::{EventKind, EventStatus, TelemetryEvent, TelemetryLogger, TimeRange};
use crate::breaker::{CircuitBreakerRegistry, CircuitState};

/// Relative weights of the score components. Normalised on use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthWeights {
    pub success: f64,
    pub latency: f64,
    pub breaker_trips: f64,
    pub recovery: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            success: 0.5,
            latency: 0.2,
            breaker_trips: 0.15,
            recovery: 0.15,
        }
    }
}

/// Health of one provider over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    /// 0.0–1.0; 1.0 when no calls were seen.
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub breaker_trips: u64,
    /// 0.0–1.0; 1.0 when the breaker never left half-open in the window.
    pub recovery_rate: f64,
    /// Weighted score, 0–100.
    pub score: f64,
    pub state: CircuitState,
    pub calls: u64,
}

/// One recorded breaker transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub provider: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub timestamp: DateTime<Utc>,
}

/// Fallback-chain statistics over a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FallbackStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_latency_ms: f64,
    /// Primary provider → fallback providers used for it, in first-use order.
    pub provider_map: BTreeMap<String, Vec<String>>,
}

/// Computes [`ProviderHealth`] from the telemetry log.
pub struct HealthScorer {
    logger: Arc<TelemetryLogger>,
    registry: Option<Arc<CircuitBreakerRegistry>>,
    latency_target: Duration,
    weights: HealthWeights,
    trip_penalty: f64,
}

impl HealthScorer {
    pub fn new(logger: Arc<TelemetryLogger>) -> Self {
        Self {
            logger,
            registry: None,
            latency_target: Duration::from_secs(2),
            weights: HealthWeights::default(),
            trip_penalty: 25.0,
        }
    }

    /// Read live breaker state from `registry` instead of inferring it from events.
    pub fn with_registry(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Mean latency at or below which the latency component scores 100.
    pub fn latency_target(mut self, target: Duration) -> Self {
        self.latency_target = target;
        self
    }

    pub fn weights(mut self, weights: HealthWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Health of `provider` over the last `window`.
    pub fn provider_health(&self, provider: &str, window: Duration) -> ProviderHealth {
        let events = self.logger.events_in(Some(TimeRange::last(window)));
        self.score_provider(provider, &events)
    }

    /// Health of every provider seen in the window or known to the registry.
    pub fn all_provider_health(&self, window: Duration) -> Vec<ProviderHealth> {
        let events = self.logger.events_in(Some(TimeRange::last(window)));
        let mut providers: BTreeSet<String> = events
            .iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    EventKind::ProviderCall | EventKind::CircuitBreakerStateChange
                )
            })
            .map(|e| e.provider.clone())
            .collect();
        if let Some(registry) = &self.registry {
            providers.extend(registry.states().into_keys());
        }
        providers
            .iter()
            .map(|p| self.score_provider(p, &events))
            .collect()
    }

    /// Breaker transitions in the last `window`, oldest first.
    pub fn state_transitions(&self, provider: Option<&str>, window: Duration) -> Vec<StateTransition> {
        let events = self.logger.events_in(Some(TimeRange::last(window)));
        let mut transitions: Vec<_> = events
            .iter()
            .filter(|e| provider.is_none_or(|p| e.provider == p))
            .filter_map(transition_of)
            .collect();
        transitions.sort_by_key(|t| t.timestamp);
        transitions
    }

    /// Fallback statistics for the last `window`.
    pub fn fallback_stats(&self, window: Duration) -> FallbackStats {
        let events = self.logger.events_in(Some(TimeRange::last(window)));
        let mut stats = FallbackStats::default();
        let mut latency_sum = 0u64;
        let mut latency_count = 0u64;

        for event in events.iter().filter(|e| e.kind == EventKind::Fallback) {
            if let Some(fallback) = event.meta_str("fallback_provider") {
                let used = stats.provider_map.entry(event.provider.clone()).or_default();
                if !used.iter().any(|p| p == fallback) {
                    used.push(fallback.to_string());
                }
            }
            if event.is_fallback_attempt() {
                continue;
            }
            stats.total += 1;
            match event.status {
                EventStatus::Failure => stats.failed += 1,
                _ => stats.successful += 1,
            }
            if let Some(ms) = event.duration_ms {
                latency_sum += ms;
                latency_count += 1;
            }
        }
        if latency_count > 0 {
            stats.average_latency_ms = latency_sum as f64 / latency_count as f64;
        }
        stats
    }

    fn score_provider(&self, provider: &str, events: &[TelemetryEvent]) -> ProviderHealth {
        let mut calls = 0u64;
        let mut successes = 0u64;
        let mut latency_sum = 0u64;
        let mut latency_count = 0u64;
        let mut trips = 0u64;
        let mut recovered = 0u64;
        let mut relapsed = 0u64;
        let mut last_state = None;

        for event in events.iter().filter(|e| e.provider == provider) {
            match event.kind {
                EventKind::ProviderCall => {
                    calls += 1;
                    if event.status != EventStatus::Failure {
                        successes += 1;
                    }
                    if let Some(ms) = event.duration_ms {
                        latency_sum += ms;
                        latency_count += 1;
                    }
                }
                EventKind::CircuitBreakerStateChange => {
                    if let Some(t) = transition_of(event) {
                        match (t.from, t.to) {
                            (_, CircuitState::Open) if t.from != CircuitState::HalfOpen => trips += 1,
                            (CircuitState::HalfOpen, CircuitState::Open) => {
                                trips += 1;
                                relapsed += 1;
                            }
                            (CircuitState::HalfOpen, CircuitState::Closed) => recovered += 1,
                            _ => {}
                        }
                        last_state = Some(t.to);
                    }
                }
                _ => {}
            }
        }

        let success_rate = if calls == 0 {
            1.0
        } else {
            successes as f64 / calls as f64
        };
        let average_latency_ms = if latency_count == 0 {
            0.0
        } else {
            latency_sum as f64 / latency_count as f64
        };
        let recovery_rate = if recovered + relapsed == 0 {
            1.0
        } else {
            recovered as f64 / (recovered + relapsed) as f64
        };

        let target_ms = self.latency_target.as_secs_f64() * 1000.0;
        let latency_score = if average_latency_ms <= target_ms || average_latency_ms == 0.0 {
            100.0
        } else {
            100.0 * target_ms / average_latency_ms
        };
        let trip_score = (100.0 - self.trip_penalty * trips as f64).max(0.0);

        let w = self.weights;
        let total_weight = w.success + w.latency + w.breaker_trips + w.recovery;
        let score = if total_weight <= 0.0 {
            0.0
        } else {
            (w.success * success_rate * 100.0
                + w.latency * latency_score
                + w.breaker_trips * trip_score
                + w.recovery * recovery_rate * 100.0)
                / total_weight
        };

        let state = match &self.registry {
            Some(registry) => registry.state(provider),
            None => last_state.unwrap_or(CircuitState::Closed),
        };

        ProviderHealth {
            provider: provider.to_string(),
            success_rate,
            average_latency_ms,
            breaker_trips: trips,
            recovery_rate,
            score: score.clamp(0.0, 100.0),
            state,
            calls,
        }
    }
}

fn transition_of(event: &TelemetryEvent) -> Option<StateTransition> {
    if event.kind != EventKind::CircuitBreakerStateChange {
        return None;
    }
    let parse = |key: &str| {
        event
            .metadata
            .get(key)
            .and_then(|v| serde_json::from_value::<CircuitState>(v.clone()).ok())
    };
    Some(StateTransition {
        provider: event.provider.clone(),
        from: parse("from")?,
        to: parse("to")?,
        timestamp: event.timestamp,
    })
}
