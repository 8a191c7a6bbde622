//! Per-provider circuit breaking.
//!
//! ```text
//! Closed --[total ≥ minimum_requests && failure rate ≥ threshold]--> Open
//! Open --[reset_timeout elapsed since last failure, next call]--> HalfOpen
//! HalfOpen --[success_threshold probe successes]--> Closed (counters zeroed)
//! HalfOpen --[any probe failure]--> Open
//! ```
//!
//! [`CircuitBreaker`] is safe to share between concurrent calls: all state
//! lives behind one mutex, which is never held across an `.await`.
//! Notifications are delivered after the lock is released, through the
//! [`BreakerNotifier`] owned by the [`CircuitBreakerRegistry`].

pub mod registry;

pub use registry::{BreakerNotifier, BreakerObserver, CircuitBreakerRegistry};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::telemetry as metric_names;
use crate::{PalisadeError, Result};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow through.
    Closed,
    /// Requests are rejected without reaching the provider.
    Open,
    /// A bounded number of probe requests test recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one breaker.
///
/// ```rust
/// # use palisade::CircuitBreakerConfig;
/// # use std::time::Duration;
/// let config = CircuitBreakerConfig::new()
///     .failure_threshold(30.0)
///     .minimum_requests(3)
///     .reset_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure rate (percent, 0–100) at or above which the breaker opens. Default: 50.
    pub failure_threshold: f64,
    /// Requests that must be seen before the failure rate is trusted. Default: 5.
    pub minimum_requests: u64,
    /// Time after the last failure before a probe is allowed. Default: 30s.
    pub reset_timeout: Duration,
    /// Probes admitted while half-open. Default: 3.
    pub half_open_max_requests: u32,
    /// Probe successes required to close. Clamped to `half_open_max_requests`. Default: 3.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 50.0,
            minimum_requests: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
            success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure-rate threshold in percent.
    pub fn failure_threshold(mut self, percent: f64) -> Self {
        self.failure_threshold = percent;
        self
    }

    /// Set the minimum request count before tripping.
    pub fn minimum_requests(mut self, n: u64) -> Self {
        self.minimum_requests = n;
        self
    }

    /// Set the open → half-open delay.
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the half-open probe budget.
    pub fn half_open_max_requests(mut self, n: u32) -> Self {
        self.half_open_max_requests = n;
        self
    }

    /// Set the probe successes needed to close.
    pub fn success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    fn effective_success_threshold(&self) -> u32 {
        self.success_threshold
            .min(self.half_open_max_requests)
            .max(1)
    }
}

/// Snapshot of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub provider: String,
    pub state: CircuitState,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    /// Failed / total, in percent. Zero when no requests were seen.
    pub failure_rate: f64,
    /// Times the breaker has opened since creation.
    pub times_opened: u64,
    /// Wall-clock time of the last failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Remaining wait before a probe is admitted, when open.
    #[serde(skip)]
    pub time_until_half_open: Option<Duration>,
}

/// Notification emitted by a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BreakerEvent {
    StateChanged {
        provider: String,
        from: CircuitState,
        to: CircuitState,
        at: DateTime<Utc>,
    },
    Failure {
        provider: String,
        error: String,
        consecutive_failures: u32,
        failure_rate: f64,
        at: DateTime<Utc>,
    },
}

impl BreakerEvent {
    pub fn provider(&self) -> &str {
        match self {
            BreakerEvent::StateChanged { provider, .. } | BreakerEvent::Failure { provider, .. } => {
                provider
            }
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    total_requests: u64,
    failed_requests: u64,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    half_open_admitted: u32,
    half_open_successes: u32,
    times_opened: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            total_requests: 0,
            failed_requests: 0,
            consecutive_failures: 0,
            last_failure: None,
            last_failure_at: None,
            half_open_admitted: 0,
            half_open_successes: 0,
            times_opened: 0,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64 * 100.0
        }
    }

    fn reset_timeout_elapsed(&self, reset_timeout: Duration) -> bool {
        self.last_failure
            .is_none_or(|at| at.elapsed() >= reset_timeout)
    }

    fn zero_counters(&mut self) {
        self.total_requests = 0;
        self.failed_requests = 0;
        self.consecutive_failures = 0;
        self.half_open_admitted = 0;
        self.half_open_successes = 0;
    }
}

/// Admission ticket for one call.
///
/// Dropping a half-open probe permit without recording an outcome (e.g. the
/// call future was cancelled) returns the probe slot.
#[must_use = "record the call outcome through the permit"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.probe);
    }

    pub fn failure(mut self, error: &PalisadeError) {
        self.settled = true;
        self.breaker.record_failure(error, self.probe);
    }

    /// Settle without affecting the breaker's counters.
    pub fn ignore(mut self) {
        self.settled = true;
        self.breaker.release_probe(self.probe);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_probe(self.probe);
        }
    }
}

/// Failure-rate circuit breaker for one provider.
pub struct CircuitBreaker {
    provider: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    notifier: Arc<BreakerNotifier>,
}

impl CircuitBreaker {
    /// Create a standalone breaker with no observers.
    pub fn new(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_notifier(provider, config, Arc::new(BreakerNotifier::default()))
    }

    pub(crate) fn with_notifier(
        provider: impl Into<String>,
        config: CircuitBreakerConfig,
        notifier: Arc<BreakerNotifier>,
    ) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            notifier,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose reset timeout has elapsed still
    /// reports `Open` until the next call turns it half-open.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call made now would be admitted.
    pub fn is_available(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.reset_timeout_elapsed(self.config.reset_timeout),
            CircuitState::HalfOpen => inner.half_open_admitted < self.config.half_open_max_requests,
        }
    }

    /// Admit a call or reject it with a fast-fail breaker error.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut transition = None;
        let admitted = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => Some(false),
                CircuitState::Open => {
                    if inner.reset_timeout_elapsed(self.config.reset_timeout) {
                        inner.state = CircuitState::HalfOpen;
                        inner.half_open_admitted = 1;
                        inner.half_open_successes = 0;
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        Some(true)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_admitted < self.config.half_open_max_requests {
                        inner.half_open_admitted += 1;
                        Some(true)
                    } else {
                        None
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            self.notify_transition(from, to);
        }

        match admitted {
            Some(probe) => Ok(BreakerPermit {
                breaker: self,
                probe,
                settled: false,
            }),
            None => {
                debug!(provider = %self.provider, "circuit open, rejecting call");
                metrics::counter!(metric_names::BREAKER_REJECTIONS_TOTAL,
                    "provider" => self.provider.clone(),
                )
                .increment(1);
                Err(PalisadeError::CircuitBreaker {
                    provider: self.provider.clone(),
                    source: None,
                })
            }
        }
    }

    /// Run `f` under this breaker.
    ///
    /// Validation and sanitization failures pass through without counting
    /// against the provider.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) if counts_against_provider(&e) => {
                permit.failure(&e);
                Err(e)
            }
            Err(e) => {
                permit.ignore();
                Err(e)
            }
        }
    }

    /// Record a successful call. Only probe outcomes move a half-open
    /// breaker; a late success from a call admitted while closed does not.
    fn record_success(&self, probe: bool) {
        let mut transition = None;
        {
            let mut inner = self.inner.lock();
            inner.total_requests += 1;
            inner.consecutive_failures = 0;
            if inner.state == CircuitState::HalfOpen && probe {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.effective_success_threshold() {
                    inner.state = CircuitState::Closed;
                    inner.zero_counters();
                    transition = Some((CircuitState::HalfOpen, CircuitState::Closed));
                }
            }
        }
        if let Some((from, to)) = transition {
            self.notify_transition(from, to);
        }
    }

    /// Record a failed call.
    fn record_failure(&self, error: &PalisadeError, probe: bool) {
        let now = Instant::now();
        let at = Utc::now();
        let mut transition = None;
        let (consecutive, rate) = {
            let mut inner = self.inner.lock();
            inner.total_requests += 1;
            inner.failed_requests += 1;
            inner.consecutive_failures += 1;
            inner.last_failure = Some(now);
            inner.last_failure_at = Some(at);

            match inner.state {
                CircuitState::Closed => {
                    if inner.total_requests >= self.config.minimum_requests
                        && inner.failure_rate() >= self.config.failure_threshold
                    {
                        inner.state = CircuitState::Open;
                        inner.times_opened += 1;
                        transition = Some((CircuitState::Closed, CircuitState::Open));
                    }
                }
                CircuitState::HalfOpen if probe => {
                    inner.state = CircuitState::Open;
                    inner.times_opened += 1;
                    inner.half_open_admitted = 0;
                    inner.half_open_successes = 0;
                    transition = Some((CircuitState::HalfOpen, CircuitState::Open));
                }
                // Late result of a call admitted before the breaker opened.
                // While open, the refreshed failure time restarts the timer.
                CircuitState::HalfOpen | CircuitState::Open => {}
            }
            (inner.consecutive_failures, inner.failure_rate())
        };

        warn!(
            provider = %self.provider,
            consecutive_failures = consecutive,
            failure_rate = rate,
            error = %error,
            "provider call failed"
        );
        self.notifier.publish(BreakerEvent::Failure {
            provider: self.provider.clone(),
            error: error.to_string(),
            consecutive_failures: consecutive,
            failure_rate: rate,
            at,
        });
        if let Some((from, to)) = transition {
            self.notify_transition(from, to);
        }
    }

    /// Force the breaker closed and zero its counters.
    pub fn reset(&self) {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            let times_opened = inner.times_opened;
            *inner = BreakerInner::new();
            inner.times_opened = times_opened;
            previous
        };
        if previous != CircuitState::Closed {
            self.notify_transition(previous, CircuitState::Closed);
        }
    }

    /// Force the breaker open as if it had just failed.
    pub fn force_open(&self) {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = CircuitState::Open;
            inner.last_failure = Some(Instant::now());
            inner.last_failure_at = Some(Utc::now());
            inner.half_open_admitted = 0;
            inner.half_open_successes = 0;
            if previous != CircuitState::Open {
                inner.times_opened += 1;
            }
            previous
        };
        if previous != CircuitState::Open {
            self.notify_transition(previous, CircuitState::Open);
        }
    }

    /// Snapshot of the counters.
    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock();
        let time_until_half_open = match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(at)) => {
                Some(self.config.reset_timeout.saturating_sub(at.elapsed()))
            }
            _ => None,
        };
        BreakerMetrics {
            provider: self.provider.clone(),
            state: inner.state,
            total_requests: inner.total_requests,
            failed_requests: inner.failed_requests,
            consecutive_failures: inner.consecutive_failures,
            failure_rate: inner.failure_rate(),
            times_opened: inner.times_opened,
            last_failure_at: inner.last_failure_at,
            time_until_half_open,
        }
    }

    fn release_probe(&self, probe: bool) {
        if !probe {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_admitted = inner.half_open_admitted.saturating_sub(1);
        }
    }

    fn notify_transition(&self, from: CircuitState, to: CircuitState) {
        info!(provider = %self.provider, %from, %to, "circuit state changed");
        metrics::counter!(metric_names::BREAKER_TRANSITIONS_TOTAL,
            "provider" => self.provider.clone(),
            "to" => to.as_str(),
        )
        .increment(1);
        self.notifier.publish(BreakerEvent::StateChanged {
            provider: self.provider.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("provider", &self.provider)
            .field("state", &self.state())
            .finish()
    }
}

/// Whether an error reflects on the provider's health.
pub(crate) fn counts_against_provider(error: &PalisadeError) -> bool {
    !matches!(
        error,
        PalisadeError::Validation(_)
            | PalisadeError::Sanitize { .. }
            | PalisadeError::Configuration(_)
            | PalisadeError::CircuitBreaker { source: None, .. }
    )
}
