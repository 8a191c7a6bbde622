mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FailThenSucceed, unauthorized, unavailable};
use palisade::middleware::{Completion, FallbackMiddleware};
use palisade::telemetry::{ATTEMPT_TIER, EventKind, EventStatus, HealthScorer};
use palisade::{
    CacheKey, FallbackConfig, GenerateOptions, GenerateRequest, GenerateResponse, MiddlewareChain,
    OperationContext, OperationKind, PalisadeError, ProviderSet, ResponseCache, Result,
    TelemetryLogger,
};

struct Harness {
    cache: Arc<ResponseCache>,
    logger: Arc<TelemetryLogger>,
    providers: Arc<ProviderSet>,
    chain: MiddlewareChain,
}

impl Harness {
    fn new(config: FallbackConfig, providers: ProviderSet) -> Self {
        let cache = Arc::new(ResponseCache::default());
        let logger = Arc::new(TelemetryLogger::default());
        let providers = Arc::new(providers);
        let chain = MiddlewareChain::new().with(
            FallbackMiddleware::new(config, cache.clone())
                .with_providers(providers.clone())
                .with_telemetry(logger.clone()),
        );
        Self {
            cache,
            logger,
            providers,
            chain,
        }
    }

    async fn call(&self, prompt: &str) -> Result<Completion> {
        self.chain
            .execute(
                GenerateRequest::new(prompt),
                GenerateOptions::default(),
                OperationContext::new(OperationKind::Insight, "alpha"),
                &self.providers.terminal(),
            )
            .await
    }

    fn seed(&self, provider: &str, prompt: &str, response: GenerateResponse) {
        let key = CacheKey::new(provider, &GenerateRequest::new(prompt), &GenerateOptions::default());
        self.cache.set(key, response, None);
    }
}

fn with_beta() -> FallbackConfig {
    FallbackConfig::new().fallback_providers(vec!["beta".into()])
}

#[tokio::test]
async fn primary_success_is_cached_and_undegraded() {
    let alpha = Arc::new(FailThenSucceed::healthy("alpha"));
    let h = Harness::new(with_beta(), ProviderSet::new().with(alpha));

    let done = h.call("weekly summary").await.unwrap();

    assert_eq!(done.response.text, "alpha: weekly summary");
    assert!(!done.response.fallback.is_degraded());
    assert!(done.response.message.is_none());
    assert_eq!(h.cache.stats().size, 1);
}

#[tokio::test]
async fn retryable_failure_switches_to_fallback_provider() {
    let alpha = Arc::new(FailThenSucceed::broken("alpha", unavailable));
    let beta = Arc::new(FailThenSucceed::healthy("beta"));
    let h = Harness::new(
        with_beta(),
        ProviderSet::new().with(alpha.clone()).with(beta.clone()),
    );

    let done = h.call("weekly summary").await.unwrap();

    assert_eq!(done.response.provider, "beta");
    assert_eq!(done.context.provider, "beta");
    assert!(!done.response.fallback.used_cache);
    assert_eq!(done.response.fallback.provider_switches, 1);
    assert_eq!(done.response.fallback.served_by.as_deref(), Some("beta"));
    assert!(done.response.message.unwrap().contains("served by beta"));

    let fallbacks: Vec<_> = h
        .logger
        .events_in(None)
        .into_iter()
        .filter(|e| e.kind == EventKind::Fallback)
        .collect();
    assert_eq!(fallbacks.len(), 1);
    assert_eq!(fallbacks[0].status, EventStatus::Success);
    assert_eq!(fallbacks[0].meta_str("fallback_provider"), Some("beta"));
}

#[tokio::test]
async fn all_providers_failing_serves_fresh_cache_with_disclosure() {
    let alpha = Arc::new(FailThenSucceed::broken("alpha", unavailable));
    let beta = Arc::new(FailThenSucceed::broken("beta", unavailable));
    let h = Harness::new(with_beta(), ProviderSet::new().with(alpha).with(beta));
    h.seed("alpha", "weekly summary", GenerateResponse::new("alpha", "steady week"));

    let done = h.call("weekly summary").await.unwrap();

    assert_eq!(done.response.text, "steady week");
    assert!(done.response.fallback.used_cache);
    assert_eq!(done.response.fallback.provider_switches, 1);
    assert_eq!(done.response.fallback.served_by.as_deref(), Some("alpha"));
    assert!(done.response.message.unwrap().contains("cached"));
}

#[tokio::test]
async fn cache_lookup_also_checks_fallback_provider_keys() {
    let alpha = Arc::new(FailThenSucceed::broken("alpha", unavailable));
    let beta = Arc::new(FailThenSucceed::broken("beta", unavailable));
    let h = Harness::new(with_beta(), ProviderSet::new().with(alpha).with(beta));
    h.seed("beta", "weekly summary", GenerateResponse::new("beta", "from beta earlier"));

    let done = h.call("weekly summary").await.unwrap();

    assert_eq!(done.response.text, "from beta earlier");
    assert_eq!(done.response.fallback.served_by.as_deref(), Some("beta"));
}

#[tokio::test]
async fn permanent_failure_skips_providers_and_uses_cache() {
    let alpha = Arc::new(FailThenSucceed::broken("alpha", unauthorized));
    let beta = Arc::new(FailThenSucceed::healthy("beta"));
    let h = Harness::new(
        with_beta(),
        ProviderSet::new().with(alpha).with(beta.clone()),
    );
    h.seed("alpha", "weekly summary", GenerateResponse::new("alpha", "steady week"));

    let done = h.call("weekly summary").await.unwrap();

    assert_eq!(done.response.text, "steady week");
    assert!(done.response.fallback.used_cache);
    assert_eq!(done.response.fallback.provider_switches, 0);
    assert_eq!(beta.call_count(), 0, "permanent errors never switch providers");
}

#[tokio::test]
async fn permanent_failure_without_cache_is_a_fallback_error() {
    let alpha = Arc::new(FailThenSucceed::broken("alpha", unauthorized));
    let h = Harness::new(with_beta(), ProviderSet::new().with(alpha));

    match h.call("weekly summary").await.unwrap_err() {
        PalisadeError::Fallback {
            attempts,
            cache_consulted,
            source,
        } => {
            assert_eq!(attempts, 1);
            assert!(cache_consulted);
            assert_eq!(source.status(), Some(401));
        }
        other => panic!("expected fallback error, got {other:?}"),
    }
}

#[tokio::test]
async fn stale_cache_entry_is_not_served() {
    let alpha = Arc::new(FailThenSucceed::broken("alpha", unavailable));
    let h = Harness::new(
        FallbackConfig::new().max_cache_age(Duration::from_secs(15 * 60)),
        ProviderSet::new().with(alpha),
    );
    let mut old = GenerateResponse::new("alpha", "last month");
    old.timestamp -= chrono::Duration::minutes(20);
    h.seed("alpha", "weekly summary", old);

    let err = h.call("weekly summary").await.unwrap_err();

    assert!(matches!(
        err,
        PalisadeError::Fallback {
            attempts: 1,
            cache_consulted: true,
            ..
        }
    ));
    let misses = h
        .logger
        .events_in(None)
        .iter()
        .filter(|e| e.kind == EventKind::CacheMiss)
        .count();
    assert_eq!(misses, 1);
}

#[tokio::test]
async fn exhaustion_reports_attempts_and_last_error() {
    let alpha = Arc::new(FailThenSucceed::broken("alpha", unavailable));
    let beta = Arc::new(FailThenSucceed::broken("beta", unavailable));
    let h = Harness::new(
        with_beta().use_cache(false),
        ProviderSet::new().with(alpha).with(beta),
    );

    match h.call("weekly summary").await.unwrap_err() {
        PalisadeError::Fallback {
            attempts,
            cache_consulted,
            source,
        } => {
            assert_eq!(attempts, 2);
            assert!(!cache_consulted);
            assert_eq!(source.provider_name(), Some("beta"));
        }
        other => panic!("expected fallback error, got {other:?}"),
    }
}

#[tokio::test]
async fn exhausted_walk_counts_as_one_fallback() {
    let alpha = Arc::new(FailThenSucceed::broken("alpha", unavailable));
    let beta = Arc::new(FailThenSucceed::broken("beta", unavailable));
    let gamma = Arc::new(FailThenSucceed::broken("gamma", unavailable));
    let h = Harness::new(
        FallbackConfig::new()
            .fallback_providers(vec!["beta".into(), "gamma".into()])
            .use_cache(false),
        ProviderSet::new().with(alpha).with(beta).with(gamma),
    );

    h.call("weekly summary").await.unwrap_err();

    let attempts = h
        .logger
        .events_in(None)
        .into_iter()
        .filter(|e| e.meta_str("tier") == Some(ATTEMPT_TIER))
        .count();
    assert_eq!(attempts, 2);

    let stats = HealthScorer::new(h.logger.clone()).fallback_stats(Duration::from_secs(60));
    assert_eq!(stats.total, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.successful, 0);
    assert_eq!(stats.provider_map["alpha"], vec!["beta", "gamma"]);
    assert_eq!(h.logger.snapshot(None).aggregate.fallbacks, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_primary_loses_the_race() {
    let alpha = Arc::new(FailThenSucceed::healthy("alpha").latency(Duration::from_secs(10)));
    let beta = Arc::new(FailThenSucceed::healthy("beta"));
    let h = Harness::new(
        with_beta().primary_timeout(Some(Duration::from_secs(2))),
        ProviderSet::new().with(alpha.clone()).with(beta),
    );

    let done = h.call("weekly summary").await.unwrap();

    assert_eq!(done.response.provider, "beta");
    assert_eq!(done.response.fallback.provider_switches, 1);
    assert_eq!(alpha.call_count(), 1);
}

#[tokio::test]
async fn cached_entries_drop_previous_disclosures() {
    let alpha = Arc::new(FailThenSucceed::broken("alpha", unavailable));
    let beta = Arc::new(FailThenSucceed::new("beta", 0, unavailable));
    let h = Harness::new(
        with_beta(),
        ProviderSet::new().with(alpha).with(beta),
    );

    h.call("weekly summary").await.unwrap();

    let key = CacheKey::new("beta", &GenerateRequest::new("weekly summary"), &GenerateOptions::default());
    let stored = h.cache.get(&key).unwrap();
    assert!(stored.message.is_none());
    assert!(!stored.fallback.is_degraded());
}
