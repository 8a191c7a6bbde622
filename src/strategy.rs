//! Ordered-provider execution without a middleware chain.
//!
//! [`ProviderStrategy`] walks its providers in order. Each one runs under
//! its breaker with retries, and the first success wins. It shares the
//! breaker registry, [`RetryConfig`] and [`ErrorClassifier`] with the chain,
//! so both paths see the same provider health. New code should prefer
//! [`Pipeline`](crate::Pipeline); this type stays for callers that only want
//! "try A, then B" without caching or sanitization.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::breaker::{CircuitBreakerRegistry, counts_against_provider};
use crate::classify::ErrorClassifier;
use crate::middleware::RetryConfig;
use crate::middleware::retry::with_retry;
use crate::providers::Provider;
use crate::telemetry::{EventKind, EventStatus, TelemetryEvent, TelemetryLogger};
use crate::types::{FallbackMetadata, GenerateOptions, GenerateRequest, GenerateResponse};
use crate::{PalisadeError, Result};

/// Try providers in order, each with retries behind its breaker.
pub struct ProviderStrategy {
    providers: Vec<Arc<dyn Provider>>,
    registry: Arc<CircuitBreakerRegistry>,
    retry: RetryConfig,
    classifier: ErrorClassifier,
    logger: Option<Arc<TelemetryLogger>>,
}

impl ProviderStrategy {
    pub fn new(registry: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            providers: Vec::new(),
            registry,
            retry: RetryConfig::default(),
            classifier: ErrorClassifier::default(),
            logger: None,
        }
    }

    /// Append a provider to the try order.
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_telemetry(mut self, logger: Arc<TelemetryLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Provider names in try order.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Run the request against the first provider that succeeds.
    ///
    /// Providers with an open breaker are skipped. Validation-class errors
    /// stop the walk. When every provider fails the result is a
    /// [`PalisadeError::CircuitBreaker`] naming the last one tried.
    pub async fn execute(
        &self,
        request: &GenerateRequest,
        options: &GenerateOptions,
    ) -> Result<GenerateResponse> {
        if self.providers.is_empty() {
            return Err(PalisadeError::NoProvider);
        }

        let mut last_failure: Option<(String, PalisadeError)> = None;
        let mut switches = 0;
        for provider in &self.providers {
            let name = provider.name();
            if !self.registry.is_available(name) {
                info!(provider = name, "skipping provider with open breaker");
                continue;
            }
            let breaker = self.registry.get(name);
            let started = Instant::now();
            let result = with_retry(&self.retry, &self.classifier, name, || {
                breaker.call(|| provider.generate(request, options))
            })
            .await;
            self.record(name, started, &result);

            match result {
                Ok(mut response) => {
                    if switches > 0 {
                        response.fallback = FallbackMetadata {
                            used_cache: false,
                            provider_switches: switches,
                            served_by: Some(name.to_owned()),
                        };
                    }
                    return Ok(response);
                }
                Err(e) if !e.is_circuit_open() && !counts_against_provider(&e) => return Err(e),
                Err(e) => {
                    warn!(provider = name, error = %e, "provider failed, trying next");
                    last_failure = Some((name.to_owned(), e));
                    switches += 1;
                }
            }
        }

        Err(match last_failure {
            Some((provider, cause)) => PalisadeError::CircuitBreaker {
                provider,
                source: Some(Box::new(cause)),
            },
            None => PalisadeError::CircuitBreaker {
                provider: self.providers[0].name().to_owned(),
                source: None,
            },
        })
    }

    fn record(&self, provider: &str, started: Instant, result: &Result<GenerateResponse>) {
        let Some(logger) = &self.logger else {
            return;
        };
        let status = if result.is_ok() {
            EventStatus::Success
        } else {
            EventStatus::Failure
        };
        let mut event = TelemetryEvent::new(EventKind::ProviderCall, status, provider)
            .operation("strategy")
            .duration(started.elapsed());
        if let Err(e) = result {
            event = event
                .error(e)
                .meta("category", self.classifier.classify(e).category.as_str());
        }
        logger.log_event(event);
    }
}

impl std::fmt::Debug for ProviderStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderStrategy")
            .field("providers", &self.provider_names())
            .field("retry", &self.retry)
            .finish()
    }
}
