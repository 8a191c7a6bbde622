//! Retry configuration, delay calculation, and the retry layer.
//!
//! [`RetryConfig`] controls attempts and backoff. [`RetryMiddleware`]
//! re-runs the rest of the chain on retryable failures, optionally moving
//! the call to another provider for specific error categories. The shared
//! [`with_retry`] helper applies the same policy to plain async closures
//! (used by [`ProviderStrategy`](crate::ProviderStrategy)).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Call, Completion, Middleware, Next};
use crate::breaker::CircuitBreakerRegistry;
use crate::classify::{ErrorCategory, ErrorClassifier};
use crate::telemetry::{self, EventKind, EventStatus, TelemetryEvent, TelemetryLogger};
use crate::{PalisadeError, Result};

/// How the base delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `initial_delay` every time.
    Fixed,
    /// `initial_delay × attempt`.
    Linear,
    /// `initial_delay × 2^(attempt-1)`.
    #[default]
    Exponential,
}

/// Configuration for retry behaviour.
///
/// ```rust
/// # use palisade::{BackoffStrategy, RetryConfig};
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(5)
///     .initial_delay(Duration::from_millis(200))
///     .backoff(BackoffStrategy::Linear)
///     .jitter(true);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial request).
    /// 1 = no retry. Default: 3.
    pub max_attempts: u32,
    /// Base delay. Default: 500ms.
    pub initial_delay: Duration,
    /// Cap on any single delay. Default: 30s.
    pub max_delay: Duration,
    /// Delay growth. Default: exponential.
    pub backoff: BackoffStrategy,
    /// Scale each delay by a random factor in `[0.5, 1.5]`. Default: true.
    pub jitter: bool,
    /// Candidate providers to move to after a failure of the given category.
    /// Rotated round-robin, skipping the provider that just failed.
    pub provider_switch: HashMap<ErrorCategory, Vec<String>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::Exponential,
            jitter: true,
            provider_switch: HashMap::new(),
        }
    }
}

impl RetryConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set maximum attempts (including the initial request).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the base delay.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff strategy.
    pub fn backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Move to one of `providers` after failures of `category`.
    pub fn switch_on(mut self, category: ErrorCategory, providers: Vec<String>) -> Self {
        self.provider_switch.insert(category, providers);
        self
    }

    /// Delay after the given failed attempt (1-based), without jitter.
    ///
    /// Capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Linear => self.initial_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => self
                .initial_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
        };
        delay.min(self.max_delay)
    }

    /// Delay actually waited after `attempt`.
    ///
    /// A provider `retry_after` hint replaces the computed backoff. Jitter
    /// (if enabled) is applied last, and the result never exceeds `max_delay`.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = retry_after.unwrap_or_else(|| self.delay_for_attempt(attempt));
        let delay = if self.jitter {
            base.mul_f64(rand::thread_rng().gen_range(0.5..=1.5))
        } else {
            base
        };
        delay.min(self.max_delay)
    }
}

// ============================================================================
// Shared retry helper
// ============================================================================

/// Execute an async operation with retry logic.
///
/// Retries errors the classifier marks retryable, up to
/// `config.max_attempts`. Non-retryable errors and breaker fast-fails are
/// returned immediately; exhaustion yields [`PalisadeError::Retry`].
pub(crate) async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    classifier: &ErrorClassifier,
    provider_name: &str,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_delay = Duration::ZERO;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match f().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        let class = classifier.classify(&err);
        if !class.retryable || err.is_circuit_open() {
            return Err(err);
        }
        if attempt >= max_attempts {
            return Err(PalisadeError::Retry {
                attempts: attempt,
                last_delay,
                source: Box::new(err),
            });
        }
        let delay = config.effective_delay(attempt, err.retry_after());
        metrics::counter!(telemetry::RETRIES_TOTAL,
            "provider" => provider_name.to_owned(),
            "category" => class.category.as_str(),
        )
        .increment(1);
        warn!(
            provider = provider_name,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient error"
        );
        tokio::time::sleep(delay).await;
        last_delay = delay;
    }
}

// ============================================================================
// RetryMiddleware
// ============================================================================

/// Layer that re-runs the rest of the chain on retryable failures.
pub struct RetryMiddleware {
    config: RetryConfig,
    classifier: ErrorClassifier,
    registry: Option<Arc<CircuitBreakerRegistry>>,
    logger: Option<Arc<TelemetryLogger>>,
}

impl RetryMiddleware {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            classifier: ErrorClassifier::default(),
            registry: None,
            logger: None,
        }
    }

    /// Use a custom classification table.
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Skip switch candidates whose breaker would reject the call, and run
    /// attempts on a switched provider under that provider's breaker.
    pub fn with_registry(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Record a telemetry event per scheduled retry.
    pub fn with_telemetry(mut self, logger: Arc<TelemetryLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Next provider to move to after a `category` failure on `current`.
    fn switch_target(
        &self,
        category: ErrorCategory,
        current: &str,
        rotation: &mut HashMap<ErrorCategory, usize>,
    ) -> Option<String> {
        let candidates: Vec<&String> = self
            .config
            .provider_switch
            .get(&category)?
            .iter()
            .filter(|p| p.as_str() != current)
            .filter(|p| self.registry.as_ref().is_none_or(|r| r.is_available(p)))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let turn = rotation.entry(category).or_insert(0);
        let target = candidates[*turn % candidates.len()].clone();
        *turn += 1;
        Some(target)
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    async fn handle(&self, call: Call, next: Next<'_>) -> Result<Completion> {
        let max_attempts = self.config.max_attempts.max(1);
        let home = call.context.provider.clone();
        let mut context = call.context.clone();
        let mut rotation = HashMap::new();
        let mut last_delay = Duration::ZERO;
        let mut attempt = 0;

        loop {
            attempt += 1;
            context = context.with_attempt(attempt);
            let attempt_call = call.with_context(context.clone());
            // The call's own provider is guarded by the breaker layer; a
            // switched attempt answers to its target's breaker.
            let result = match &self.registry {
                Some(registry) if context.provider != home => {
                    let breaker = registry.get(&context.provider);
                    breaker.call(|| next.run(attempt_call)).await
                }
                _ => next.run(attempt_call).await,
            };
            let err = match result {
                Ok(done) => return Ok(done),
                Err(e) => e,
            };

            if err.is_circuit_open() {
                debug!(provider = %context.provider, "breaker open, not retrying");
                return Err(err);
            }
            let class = self.classifier.classify(&err);
            if !class.retryable {
                debug!(
                    provider = %context.provider,
                    category = %class.category,
                    error = %err,
                    "not retrying permanent error"
                );
                return Err(err);
            }
            if attempt >= max_attempts {
                return Err(PalisadeError::Retry {
                    attempts: attempt,
                    last_delay,
                    source: Box::new(err),
                });
            }

            let delay = self.config.effective_delay(attempt, err.retry_after());
            let failed_provider = context.provider.clone();
            context = context.with_last_error(&err);
            if let Some(target) = self.switch_target(class.category, &failed_provider, &mut rotation)
            {
                debug!(from = %failed_provider, to = %target, "switching provider for retry");
                context = context.with_provider(target);
            }

            metrics::counter!(telemetry::RETRIES_TOTAL,
                "provider" => failed_provider.clone(),
                "category" => class.category.as_str(),
            )
            .increment(1);
            warn!(
                provider = %failed_provider,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient error"
            );
            if let Some(logger) = &self.logger {
                logger.log_event(
                    TelemetryEvent::new(EventKind::Retry, EventStatus::Info, &failed_provider)
                        .operation(context.kind.as_str())
                        .error(&err)
                        .meta("attempt", attempt)
                        .meta("delay_ms", delay.as_millis() as u64)
                        .meta("category", class.category.as_str())
                        .meta("next_provider", context.provider.as_str()),
                );
            }

            tokio::time::sleep(delay).await;
            last_delay = delay;
        }
    }
}
