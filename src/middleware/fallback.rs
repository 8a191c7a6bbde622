//! Graceful degradation.
//!
//! Three tiers, tried in order:
//!
//! 1. **Primary**: the rest of the chain, raced against `primary_timeout`.
//!    Successful results are written to the cache.
//! 2. **Cache for permanent errors**: a non-retryable failure is answered
//!    from the cache if an entry no older than `max_cache_age` exists.
//! 3. **Alternate providers, then cache**: a retryable failure walks the
//!    fallback providers; if all fail, the cache is consulted last.
//!
//! Every response leaving this layer carries [`FallbackMetadata`] and, when
//! degraded, a human-readable disclosure in `message`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Call, Completion, Middleware, Next};
use crate::cache::ResponseCache;
use crate::classify::ErrorClassifier;
use crate::providers::{CacheKey, ProviderSet};
use crate::telemetry::{
    self, ATTEMPT_TIER, EventKind, EventStatus, TelemetryEvent, TelemetryLogger,
};
use crate::types::FallbackMetadata;
use crate::{PalisadeError, Result};

/// Configuration for [`FallbackMiddleware`].
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackConfig {
    /// Deadline for each live attempt (primary and alternates).
    /// `None` disables the race. Default: 30s.
    pub primary_timeout: Option<Duration>,
    /// Alternate providers, in order.
    pub fallback_providers: Vec<String>,
    /// Write successful live results to the cache. Default: true.
    pub cache_results: bool,
    /// TTL for written entries. `None` uses the cache default.
    pub cache_ttl: Option<Duration>,
    /// Serve cached results when live attempts fail. Default: true.
    pub use_cache: bool,
    /// Oldest cached result that may still be served, measured from the
    /// response timestamp. Default: 15 minutes.
    pub max_cache_age: Duration,
    /// Disclosure appended when serving from the cache.
    pub cached_message: String,
    /// Disclosure appended when an alternate provider served the call.
    /// `{provider}` is replaced with its name.
    pub provider_message: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            primary_timeout: Some(Duration::from_secs(30)),
            fallback_providers: Vec::new(),
            cache_results: true,
            cache_ttl: None,
            use_cache: true,
            max_cache_age: Duration::from_secs(15 * 60),
            cached_message: "Live generation is unavailable; this is a cached result.".into(),
            provider_message: "Primary provider unavailable; served by {provider}.".into(),
        }
    }
}

impl FallbackConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn primary_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.primary_timeout = timeout;
        self
    }

    pub fn fallback_providers(mut self, providers: Vec<String>) -> Self {
        self.fallback_providers = providers;
        self
    }

    pub fn cache_results(mut self, enabled: bool) -> Self {
        self.cache_results = enabled;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn use_cache(mut self, enabled: bool) -> Self {
        self.use_cache = enabled;
        self
    }

    pub fn max_cache_age(mut self, age: Duration) -> Self {
        self.max_cache_age = age;
        self
    }

    pub fn cached_message(mut self, message: impl Into<String>) -> Self {
        self.cached_message = message.into();
        self
    }

    pub fn provider_message(mut self, message: impl Into<String>) -> Self {
        self.provider_message = message.into();
        self
    }
}

/// Degradation layer. See the module docs for the tiers.
pub struct FallbackMiddleware {
    config: FallbackConfig,
    cache: Arc<ResponseCache>,
    classifier: ErrorClassifier,
    providers: Option<Arc<ProviderSet>>,
    logger: Option<Arc<TelemetryLogger>>,
}

impl FallbackMiddleware {
    pub fn new(config: FallbackConfig, cache: Arc<ResponseCache>) -> Self {
        Self {
            config,
            cache,
            classifier: ErrorClassifier::default(),
            providers: None,
            logger: None,
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Derive cache keys through the registered providers' own keying.
    pub fn with_providers(mut self, providers: Arc<ProviderSet>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn with_telemetry(mut self, logger: Arc<TelemetryLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    fn key_for(&self, provider: &str, call: &Call) -> CacheKey {
        match &self.providers {
            Some(set) => set.cache_key(provider, &call.request, &call.options),
            None => CacheKey::new(provider, &call.request, &call.options),
        }
    }

    async fn live(&self, call: Call, next: Next<'_>) -> Result<Completion> {
        let Some(limit) = self.config.primary_timeout else {
            return next.run(call).await;
        };
        let started = Instant::now();
        match tokio::time::timeout(limit, next.run(call)).await {
            Ok(result) => result,
            Err(_) => Err(PalisadeError::Timeout {
                elapsed: started.elapsed(),
            }),
        }
    }

    fn store(&self, call: &Call, done: &Completion) {
        if !self.config.cache_results {
            return;
        }
        let mut value = done.response.clone();
        value.message = None;
        value.fallback = FallbackMetadata::default();
        let key = self.key_for(&done.context.provider, call);
        self.cache.set(key, value, self.config.cache_ttl);
    }

    /// Freshest acceptable cached answer for the call, checking the primary
    /// provider's key first and then each alternate's.
    fn from_cache(&self, call: &Call, primary: &str, switches: u32) -> Option<Completion> {
        if !self.config.use_cache {
            return None;
        }
        let now = Utc::now();
        let candidates =
            std::iter::once(primary).chain(self.config.fallback_providers.iter().map(String::as_str));
        for provider in candidates {
            let Some(mut response) = self.cache.get(&self.key_for(provider, call)) else {
                continue;
            };
            let age = response.age(now);
            if age > self.config.max_cache_age {
                debug!(
                    provider,
                    age_ms = age.as_millis() as u64,
                    "cached result too old to serve"
                );
                continue;
            }
            response.fallback = FallbackMetadata {
                used_cache: true,
                provider_switches: switches,
                served_by: Some(response.provider.clone()),
            };
            response.append_message(&self.config.cached_message);
            self.record(EventKind::CacheHit, EventStatus::Success, provider, call, "cache", None);
            let context = call.context.with_provider(response.provider.clone());
            return Some(Completion { response, context });
        }
        self.record(EventKind::CacheMiss, EventStatus::Info, primary, call, "cache", None);
        None
    }

    fn record(
        &self,
        kind: EventKind,
        status: EventStatus,
        provider: &str,
        call: &Call,
        tier: &str,
        error: Option<&PalisadeError>,
    ) {
        let Some(logger) = &self.logger else {
            return;
        };
        let mut event = TelemetryEvent::new(kind, status, provider)
            .operation(call.context.kind.as_str())
            .meta("tier", tier)
            .meta("primary", call.context.provider.as_str());
        if let Some(e) = error {
            event = event.error(e);
        }
        logger.log_event(event);
    }
}

#[async_trait]
impl Middleware for FallbackMiddleware {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn handle(&self, call: Call, next: Next<'_>) -> Result<Completion> {
        let primary = call.context.provider.clone();
        let mut attempts = 1;

        // Tier 1: primary.
        let first_error = match self.live(call.clone(), next).await {
            Ok(mut done) => {
                self.store(&call, &done);
                done.response.fallback = FallbackMetadata::default();
                return Ok(done);
            }
            Err(e) => e,
        };

        let class = self.classifier.classify(&first_error);
        if !class.retryable {
            // Tier 2: permanent error, cache only.
            debug!(provider = %primary, category = %class.category, "permanent failure, consulting cache");
            if let Some(done) = self.from_cache(&call, &primary, 0) {
                metrics::counter!(telemetry::FALLBACKS_TOTAL, "tier" => "cache").increment(1);
                self.record(EventKind::Fallback, EventStatus::Success, &primary, &call, "cache", None);
                info!(provider = %primary, "served cached result after permanent failure");
                return Ok(done);
            }
            return Err(PalisadeError::Fallback {
                attempts,
                cache_consulted: self.config.use_cache,
                source: Box::new(first_error),
            });
        }

        // Tier 3: alternate providers, then cache.
        let mut last_error = first_error;
        let alternates = self
            .config
            .fallback_providers
            .iter()
            .filter(|p| **p != primary);
        for (index, provider) in alternates.enumerate() {
            attempts += 1;
            let switches = index as u32 + 1;
            let started = Instant::now();
            let context = call
                .context
                .with_provider(provider.as_str())
                .with_last_error(&last_error);
            match self.live(call.with_context(context), next).await {
                Ok(mut done) => {
                    self.store(&call, &done);
                    let served_by = done.context.provider.clone();
                    done.response.fallback = FallbackMetadata {
                        used_cache: false,
                        provider_switches: switches,
                        served_by: Some(served_by.clone()),
                    };
                    let message = self.config.provider_message.replace("{provider}", &served_by);
                    done.response.append_message(&message);
                    metrics::counter!(telemetry::FALLBACKS_TOTAL, "tier" => "provider").increment(1);
                    info!(primary = %primary, served_by = %served_by, "served by fallback provider");
                    if let Some(logger) = &self.logger {
                        logger.log_event(
                            TelemetryEvent::new(EventKind::Fallback, EventStatus::Success, &primary)
                                .operation(call.context.kind.as_str())
                                .duration(started.elapsed())
                                .meta("tier", "provider")
                                .meta("fallback_provider", served_by.as_str()),
                        );
                    }
                    return Ok(done);
                }
                Err(e) => {
                    warn!(provider = %provider, error = %e, "fallback provider failed");
                    if let Some(logger) = &self.logger {
                        logger.log_event(
                            TelemetryEvent::new(EventKind::Fallback, EventStatus::Failure, &primary)
                                .operation(call.context.kind.as_str())
                                .duration(started.elapsed())
                                .error(&e)
                                .meta("tier", ATTEMPT_TIER)
                                .meta("fallback_provider", provider.as_str()),
                        );
                    }
                    last_error = e;
                }
            }
        }

        if let Some(done) = self.from_cache(&call, &primary, attempts - 1) {
            metrics::counter!(telemetry::FALLBACKS_TOTAL, "tier" => "cache").increment(1);
            self.record(EventKind::Fallback, EventStatus::Success, &primary, &call, "cache", None);
            info!(provider = %primary, "served cached result after provider fallback failed");
            return Ok(done);
        }

        self.record(
            EventKind::Fallback,
            EventStatus::Failure,
            &primary,
            &call,
            "exhausted",
            Some(&last_error),
        );
        Err(PalisadeError::Fallback {
            attempts,
            cache_consulted: self.config.use_cache,
            source: Box::new(last_error),
        })
    }
}
