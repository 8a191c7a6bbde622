//! Breaker-guarded failover across providers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Call, Completion, Middleware, Next};
use crate::breaker::{CircuitBreakerRegistry, counts_against_provider};
use crate::{PalisadeError, Result};

/// Configuration for [`CircuitBreakerMiddleware`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakerLayerConfig {
    /// Providers tried, in order, after the call's current provider.
    pub fallback_providers: Vec<String>,
}

impl BreakerLayerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fallback_providers(mut self, providers: Vec<String>) -> Self {
        self.fallback_providers = providers;
        self
    }
}

/// Runs the rest of the chain through each provider's breaker in turn.
///
/// Try order is the call's current provider followed by the configured
/// fallbacks, deduplicated and filtered to providers whose breaker would
/// admit a call. Validation-class failures stop the walk immediately; any
/// other failure moves on to the next provider.
pub struct CircuitBreakerMiddleware {
    registry: Arc<CircuitBreakerRegistry>,
    config: BreakerLayerConfig,
}

impl CircuitBreakerMiddleware {
    pub fn new(registry: Arc<CircuitBreakerRegistry>, config: BreakerLayerConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    fn try_order(&self, current: &str) -> Vec<String> {
        let mut order = vec![current.to_owned()];
        for provider in &self.config.fallback_providers {
            if !order.contains(provider) {
                order.push(provider.clone());
            }
        }
        order
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    async fn handle(&self, call: Call, next: Next<'_>) -> Result<Completion> {
        let current = call.context.provider.clone();
        let candidates = self.registry.available_providers(&self.try_order(&current));
        if candidates.is_empty() {
            debug!(provider = %current, "no provider available, failing fast");
            return Err(PalisadeError::CircuitBreaker {
                provider: current,
                source: None,
            });
        }

        let mut last_failure: Option<(String, PalisadeError)> = None;
        for provider in candidates {
            let breaker = self.registry.get(&provider);
            let permit = match breaker.acquire() {
                Ok(permit) => permit,
                // Lost a race with another caller tripping the breaker.
                Err(e) => {
                    debug!(provider = %provider, "breaker opened before call");
                    last_failure = Some((provider, e));
                    continue;
                }
            };
            let attempt = call.with_context(call.context.with_provider(provider.as_str()));
            match next.run(attempt).await {
                Ok(done) if done.context.provider == provider => {
                    permit.success();
                    return Ok(done);
                }
                // An inner retry moved the call elsewhere, which it only does
                // after this provider's own attempt failed. The target's
                // outcome was charged to the target's breaker.
                Ok(done) => {
                    let cause = PalisadeError::provider(
                        provider.as_str(),
                        done.context
                            .last_error
                            .clone()
                            .unwrap_or_else(|| format!("moved to {}", done.context.provider)),
                    );
                    permit.failure(&cause);
                    return Ok(done);
                }
                Err(e) if e.is_circuit_open() => {
                    permit.ignore();
                    debug!(provider = %provider, error = %e, "inner breaker rejected call");
                    last_failure = Some((provider, e));
                }
                Err(e) if !counts_against_provider(&e) => {
                    permit.ignore();
                    return Err(e);
                }
                Err(e) => {
                    permit.failure(&e);
                    warn!(provider = %provider, error = %e, "provider failed, trying next");
                    last_failure = Some((provider, e));
                }
            }
        }

        Err(match last_failure {
            Some((provider, cause)) => PalisadeError::CircuitBreaker {
                provider,
                source: Some(Box::new(cause)),
            },
            None => PalisadeError::CircuitBreaker {
                provider: current,
                source: None,
            },
        })
    }
}
