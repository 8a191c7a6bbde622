//! Fully assembled resilience pipeline.
//!
//! [`PipelineBuilder`] wires the shared state (breaker registry, response
//! cache, telemetry logger) into a [`MiddlewareChain`] in the canonical
//! order, outermost first:
//!
//! ```text
//! sanitize → fallback → circuit_breaker → retry → telemetry → timeout → provider
//! ```
//!
//! Sanitize sees the original request and the final response. Fallback
//! absorbs everything beneath it. The breaker counts one outcome per
//! retried call. Telemetry records each attempt, and the timeout bounds a
//! single attempt.
//!
//! When the fallback layer is enabled it owns provider failover, and the
//! breaker layer guards only the call's current provider. Without it, the
//! breaker layer walks the fallback providers itself.

use std::sync::Arc;

use tracing::info;

use crate::breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::cache::{CacheConfig, ResponseCache};
use crate::classify::ErrorClassifier;
use crate::config::Config;
use crate::middleware::{
    BreakerLayerConfig, CircuitBreakerMiddleware, Completion, FallbackConfig, FallbackMiddleware,
    MiddlewareChain, RetryConfig, RetryMiddleware, SanitizeConfig, SanitizeMiddleware,
    TelemetryMiddleware, TimeoutConfig, TimeoutMiddleware,
};
use crate::providers::{Provider, ProviderSet};
use crate::telemetry::{HealthScorer, TelemetryConfig, TelemetryLogger};
use crate::types::{
    GenerateOptions, GenerateRequest, GenerateResponse, OperationContext, OperationKind,
};
use crate::{PalisadeError, Result};

/// Assembled chain plus the state it shares.
pub struct Pipeline {
    chain: MiddlewareChain,
    providers: Arc<ProviderSet>,
    primary: String,
    registry: Arc<CircuitBreakerRegistry>,
    cache: Arc<ResponseCache>,
    logger: Arc<TelemetryLogger>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Generate text with the primary provider.
    pub async fn generate(
        &self,
        request: GenerateRequest,
        options: GenerateOptions,
    ) -> Result<GenerateResponse> {
        self.execute(OperationKind::Generate, request, options)
            .await
            .map(|done| done.response)
    }

    /// Run an operation of any kind through the chain.
    pub async fn execute(
        &self,
        kind: OperationKind,
        request: GenerateRequest,
        options: GenerateOptions,
    ) -> Result<Completion> {
        let context = OperationContext::new(kind, self.primary.as_str());
        let terminal = self.providers.terminal();
        self.chain.execute(request, options, context, &terminal).await
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn chain(&self) -> &MiddlewareChain {
        &self.chain
    }

    pub fn providers(&self) -> &Arc<ProviderSet> {
        &self.providers
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn logger(&self) -> &Arc<TelemetryLogger> {
        &self.logger
    }

    /// Health scorer over this pipeline's telemetry and breakers.
    pub fn health(&self) -> HealthScorer {
        HealthScorer::new(Arc::clone(&self.logger)).with_registry(Arc::clone(&self.registry))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("primary", &self.primary)
            .field("providers", &self.providers.names())
            .field("layers", &self.chain.layer_names())
            .finish()
    }
}

/// Builder for [`Pipeline`].
///
/// Every layer except sanitize is enabled with default settings; sanitize
/// is opt-in because its limits and policy are deployment-specific.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use palisade::{Pipeline, Provider, RetryConfig};
/// # fn demo(alpha: Arc<dyn Provider>, beta: Arc<dyn Provider>) -> palisade::Result<()> {
/// let pipeline = Pipeline::builder()
///     .provider(alpha)
///     .provider(beta)
///     .primary("alpha")
///     .fallback_providers(vec!["beta".into()])
///     .retry(RetryConfig::new().max_attempts(2))
///     .build()?;
/// # let _ = pipeline;
/// # Ok(())
/// # }
/// ```
pub struct PipelineBuilder {
    providers: ProviderSet,
    primary: Option<String>,
    fallback_providers: Vec<String>,
    breaker: Option<CircuitBreakerConfig>,
    breaker_overrides: Vec<(String, CircuitBreakerConfig)>,
    retry: Option<RetryConfig>,
    timeout: Option<TimeoutConfig>,
    fallback: Option<FallbackConfig>,
    sanitize: Option<SanitizeConfig>,
    record_attempts: bool,
    telemetry: TelemetryConfig,
    cache: CacheConfig,
    classifier: ErrorClassifier,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            providers: ProviderSet::new(),
            primary: None,
            fallback_providers: Vec::new(),
            breaker: Some(CircuitBreakerConfig::default()),
            breaker_overrides: Vec::new(),
            retry: Some(RetryConfig::default()),
            timeout: Some(TimeoutConfig::default()),
            fallback: Some(FallbackConfig::default()),
            sanitize: None,
            record_attempts: true,
            telemetry: TelemetryConfig::default(),
            cache: CacheConfig::default(),
            classifier: ErrorClassifier::default(),
        }
    }

    /// Builder pre-populated from a configuration file. Providers still
    /// have to be registered.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut builder = Self::new()
            .fallback_providers(config.pipeline.fallback_providers.clone())
            .breaker(config.breaker.to_breaker_config()?)
            .cache(config.cache.to_cache_config())
            .telemetry(config.telemetry.to_telemetry_config())
            .classifier(config.classify.to_classifier()?);
        builder.breaker_overrides = config.breaker.provider_overrides()?;
        if let Some(primary) = &config.pipeline.primary {
            builder = builder.primary(primary.clone());
        }
        builder.retry = config
            .retry
            .enabled
            .then(|| config.retry.to_retry_config())
            .transpose()?;
        builder.timeout = config
            .timeout
            .enabled
            .then(|| config.timeout.to_timeout_config())
            .transpose()?;
        builder.fallback = config.fallback.enabled.then(|| {
            config
                .fallback
                .to_fallback_config(config.pipeline.fallback_providers.clone())
        });
        builder.sanitize = config
            .sanitize
            .enabled
            .then(|| config.sanitize.to_sanitize_config())
            .transpose()?;
        builder.record_attempts = config.telemetry.enabled;
        Ok(builder)
    }

    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.add(provider);
        self
    }

    /// Provider tried first. Defaults to the alphabetically first name.
    pub fn primary(mut self, name: impl Into<String>) -> Self {
        self.primary = Some(name.into());
        self
    }

    pub fn fallback_providers(mut self, providers: Vec<String>) -> Self {
        self.fallback_providers = providers;
        self
    }

    pub fn breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(config);
        self
    }

    pub fn breaker_for(mut self, provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.breaker_overrides.push((provider.into(), config));
        self
    }

    pub fn without_breaker(mut self) -> Self {
        self.breaker = None;
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry = None;
        self
    }

    pub fn timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = Some(config);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Fallback settings. Its `fallback_providers` is replaced by the
    /// builder's list at build time.
    pub fn fallback(mut self, config: FallbackConfig) -> Self {
        self.fallback = Some(config);
        self
    }

    pub fn without_fallback(mut self) -> Self {
        self.fallback = None;
        self
    }

    pub fn sanitize(mut self, config: SanitizeConfig) -> Self {
        self.sanitize = Some(config);
        self
    }

    /// Skip the per-attempt telemetry layer. Breaker and fallback events
    /// are still logged.
    pub fn without_attempt_telemetry(mut self) -> Self {
        self.record_attempts = false;
        self
    }

    pub fn telemetry(mut self, config: TelemetryConfig) -> Self {
        self.telemetry = config;
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Assemble the pipeline.
    ///
    /// Fails if no provider is registered, or if the primary or a fallback
    /// provider names an unregistered provider.
    pub fn build(self) -> Result<Pipeline> {
        if self.providers.is_empty() {
            return Err(PalisadeError::NoProvider);
        }
        let primary = match self.primary {
            Some(name) => name,
            None => self.providers.names().remove(0),
        };
        for name in std::iter::once(&primary).chain(&self.fallback_providers) {
            if !self.providers.contains(name) {
                return Err(PalisadeError::Configuration(format!(
                    "provider {name:?} is not registered"
                )));
            }
        }

        let providers = Arc::new(self.providers);
        let logger = Arc::new(TelemetryLogger::new(&self.telemetry));
        let cache = Arc::new(ResponseCache::new(&self.cache));
        let mut registry = CircuitBreakerRegistry::new(self.breaker.clone().unwrap_or_default());
        for (name, config) in self.breaker_overrides {
            registry = registry.with_provider_config(name, config);
        }
        let registry = Arc::new(registry);
        registry.add_observer(logger.clone());

        let mut chain = MiddlewareChain::new();
        if let Some(config) = self.sanitize {
            chain = chain.with(SanitizeMiddleware::new(config).with_telemetry(Arc::clone(&logger)));
        }
        let failover_in_fallback = self.fallback.is_some();
        if let Some(config) = self.fallback {
            chain = chain.with(
                FallbackMiddleware::new(
                    config.fallback_providers(self.fallback_providers.clone()),
                    Arc::clone(&cache),
                )
                .with_classifier(self.classifier.clone())
                .with_providers(Arc::clone(&providers))
                .with_telemetry(Arc::clone(&logger)),
            );
        }
        if self.breaker.is_some() {
            let layer = if failover_in_fallback {
                BreakerLayerConfig::new()
            } else {
                BreakerLayerConfig::new().fallback_providers(self.fallback_providers.clone())
            };
            chain = chain.with(CircuitBreakerMiddleware::new(Arc::clone(&registry), layer));
        }
        if let Some(config) = self.retry {
            chain = chain.with(
                RetryMiddleware::new(config)
                    .with_classifier(self.classifier.clone())
                    .with_registry(Arc::clone(&registry))
                    .with_telemetry(Arc::clone(&logger)),
            );
        }
        if self.record_attempts {
            chain = chain.with(
                TelemetryMiddleware::new(Arc::clone(&logger)).with_classifier(self.classifier.clone()),
            );
        }
        if let Some(config) = self.timeout {
            chain = chain.with(TimeoutMiddleware::new(config));
        }

        info!(
            primary = %primary,
            providers = ?providers.names(),
            layers = ?chain.layer_names(),
            "pipeline assembled"
        );
        Ok(Pipeline {
            chain,
            providers,
            primary,
            registry,
            cache,
            logger,
        })
    }
}
