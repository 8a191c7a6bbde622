mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FailThenSucceed, rate_limited, unauthorized, unavailable};
use palisade::middleware::{
    CircuitBreakerMiddleware, Completion, RetryMiddleware, TelemetryMiddleware,
};
use palisade::telemetry::{EventKind, EventStatus};
use palisade::{
    BackoffStrategy, BreakerLayerConfig, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitState, ErrorCategory, GenerateOptions, GenerateRequest, MiddlewareChain,
    OperationContext, OperationKind, PalisadeError, ProviderSet, Result, RetryConfig,
    TelemetryLogger,
};
use tokio::time::Instant;

fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .max_attempts(3)
        .initial_delay(Duration::from_millis(100))
        .jitter(false)
}

async fn run(chain: &MiddlewareChain, providers: ProviderSet) -> Result<Completion> {
    let providers = Arc::new(providers);
    chain
        .execute(
            GenerateRequest::new("hello"),
            GenerateOptions::default(),
            OperationContext::new(OperationKind::Generate, "alpha"),
            &providers.terminal(),
        )
        .await
}

#[tokio::test(start_paused = true)]
async fn retries_on_transient_error_then_succeeds() {
    let alpha = Arc::new(FailThenSucceed::new("alpha", 2, rate_limited));
    let chain = MiddlewareChain::new().with(RetryMiddleware::new(fast_retry()));

    let done = run(&chain, ProviderSet::new().with(alpha.clone())).await.unwrap();

    assert_eq!(done.response.text, "alpha: hello");
    assert_eq!(done.context.attempt, 3);
    assert_eq!(alpha.call_count(), 3); // 2 failures + 1 success
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let alpha = Arc::new(FailThenSucceed::broken("alpha", unavailable));
    let chain = MiddlewareChain::new().with(RetryMiddleware::new(fast_retry()));

    let err = run(&chain, ProviderSet::new().with(alpha.clone())).await.unwrap_err();

    match err {
        PalisadeError::Retry {
            attempts,
            last_delay,
            source,
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(last_delay, Duration::from_millis(200));
            assert_eq!(source.provider_name(), Some("alpha"));
        }
        other => panic!("expected retry error, got {other:?}"),
    }
    assert_eq!(alpha.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn does_not_retry_permanent_errors() {
    let alpha = Arc::new(FailThenSucceed::new("alpha", 1, unauthorized));
    let chain = MiddlewareChain::new().with(RetryMiddleware::new(fast_retry()));

    let err = run(&chain, ProviderSet::new().with(alpha.clone())).await.unwrap_err();

    assert_eq!(alpha.call_count(), 1);
    // The chain reports a surviving raw provider error as a one-attempt retry error.
    match err {
        PalisadeError::Retry {
            attempts, source, ..
        } => {
            assert_eq!(attempts, 1);
            assert_eq!(source.status(), Some(401));
        }
        other => panic!("expected retry error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn exponential_backoff_waits_between_attempts() {
    let alpha = Arc::new(FailThenSucceed::new("alpha", 3, unavailable));
    let chain = MiddlewareChain::new().with(RetryMiddleware::new(fast_retry().max_attempts(4)));

    let started = Instant::now();
    run(&chain, ProviderSet::new().with(alpha)).await.unwrap();

    // 100 + 200 + 400
    assert_eq!(started.elapsed(), Duration::from_millis(700));
}

#[tokio::test(start_paused = true)]
async fn fixed_backoff_waits_the_same_each_time() {
    let alpha = Arc::new(FailThenSucceed::new("alpha", 2, unavailable));
    let config = fast_retry().backoff(BackoffStrategy::Fixed);
    let chain = MiddlewareChain::new().with(RetryMiddleware::new(config));

    let started = Instant::now();
    run(&chain, ProviderSet::new().with(alpha)).await.unwrap();

    assert_eq!(started.elapsed(), Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn retry_after_hint_replaces_backoff() {
    let alpha = Arc::new(FailThenSucceed::new("alpha", 1, |p| PalisadeError::Provider {
        provider: p.to_string(),
        status: Some(429),
        message: "slow down".into(),
        retry_after: Some(Duration::from_secs(2)),
    }));
    let chain = MiddlewareChain::new().with(RetryMiddleware::new(fast_retry()));

    let started = Instant::now();
    run(&chain, ProviderSet::new().with(alpha)).await.unwrap();

    assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn switches_provider_on_configured_category() {
    let alpha = Arc::new(FailThenSucceed::broken("alpha", rate_limited));
    let beta = Arc::new(FailThenSucceed::healthy("beta"));
    let config = fast_retry().switch_on(ErrorCategory::RateLimit, vec!["alpha".into(), "beta".into()]);
    let chain = MiddlewareChain::new().with(RetryMiddleware::new(config));

    let done = run(&chain, ProviderSet::new().with(alpha.clone()).with(beta.clone()))
        .await
        .unwrap();

    assert_eq!(done.response.provider, "beta");
    assert_eq!(done.context.provider, "beta");
    assert!(done.context.last_error.is_some());
    assert_eq!(alpha.call_count(), 1);
    assert_eq!(beta.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn no_switch_for_other_categories() {
    let alpha = Arc::new(FailThenSucceed::new("alpha", 1, unavailable));
    let beta = Arc::new(FailThenSucceed::healthy("beta"));
    let config = fast_retry().switch_on(ErrorCategory::RateLimit, vec!["beta".into()]);
    let chain = MiddlewareChain::new().with(RetryMiddleware::new(config));

    let done = run(&chain, ProviderSet::new().with(alpha.clone()).with(beta.clone()))
        .await
        .unwrap();

    assert_eq!(done.response.provider, "alpha");
    assert_eq!(beta.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn telemetry_records_each_attempt() {
    let alpha = Arc::new(FailThenSucceed::new("alpha", 2, rate_limited));
    let logger = Arc::new(TelemetryLogger::default());
    let chain = MiddlewareChain::new()
        .with(RetryMiddleware::new(fast_retry()).with_telemetry(logger.clone()))
        .with(TelemetryMiddleware::new(logger.clone()));

    run(&chain, ProviderSet::new().with(alpha)).await.unwrap();

    let events = logger.events_in(None);
    let calls: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::ProviderCall)
        .collect();
    assert_eq!(calls.len(), 3);
    assert_eq!(
        calls.iter().map(|e| e.status).collect::<Vec<_>>(),
        vec![EventStatus::Failure, EventStatus::Failure, EventStatus::Success]
    );
    assert_eq!(calls[0].metadata["category"], "rate_limit");
    assert_eq!(calls[2].metadata["attempt"], 3);

    let retries = events.iter().filter(|e| e.kind == EventKind::Retry).count();
    assert_eq!(retries, 2);
}

fn guarded_switching_chain(registry: &Arc<CircuitBreakerRegistry>) -> MiddlewareChain {
    let config = fast_retry()
        .max_attempts(2)
        .switch_on(ErrorCategory::RateLimit, vec!["beta".into()]);
    MiddlewareChain::new()
        .with(CircuitBreakerMiddleware::new(
            registry.clone(),
            BreakerLayerConfig::new(),
        ))
        .with(RetryMiddleware::new(config).with_registry(registry.clone()))
}

fn registry() -> Arc<CircuitBreakerRegistry> {
    Arc::new(CircuitBreakerRegistry::new(
        CircuitBreakerConfig::new()
            .failure_threshold(50.0)
            .minimum_requests(3),
    ))
}

#[tokio::test(start_paused = true)]
async fn switched_attempts_are_charged_to_their_own_breaker() {
    let registry = registry();
    let chain = guarded_switching_chain(&registry);
    let alpha = Arc::new(FailThenSucceed::broken("alpha", rate_limited));
    let beta = Arc::new(FailThenSucceed::broken("beta", unavailable));

    for _ in 0..3 {
        let err = run(&chain, ProviderSet::new().with(alpha.clone()).with(beta.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, PalisadeError::CircuitBreaker { source: Some(_), .. }));
    }

    assert_eq!(alpha.call_count(), 3);
    assert_eq!(beta.call_count(), 3);
    let alpha_metrics = registry.metrics("alpha").unwrap();
    let beta_metrics = registry.metrics("beta").unwrap();
    assert_eq!(alpha_metrics.failed_requests, 3, "one failed attempt per call");
    assert_eq!(beta_metrics.failed_requests, 3);
    assert_eq!(alpha_metrics.state, CircuitState::Open);
    assert_eq!(beta_metrics.state, CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn switch_success_still_counts_the_failed_provider() {
    let registry = registry();
    let chain = guarded_switching_chain(&registry);
    let alpha = Arc::new(FailThenSucceed::broken("alpha", rate_limited));
    let beta = Arc::new(FailThenSucceed::healthy("beta"));

    let done = run(&chain, ProviderSet::new().with(alpha).with(beta))
        .await
        .unwrap();
    assert_eq!(done.response.provider, "beta");

    let alpha_metrics = registry.metrics("alpha").unwrap();
    assert_eq!(alpha_metrics.total_requests, 1);
    assert_eq!(alpha_metrics.failed_requests, 1);
    let beta_metrics = registry.metrics("beta").unwrap();
    assert_eq!(beta_metrics.total_requests, 1);
    assert_eq!(beta_metrics.failed_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_is_not_retried() {
    let registry = registry();
    registry.get("alpha").force_open();
    let alpha = Arc::new(FailThenSucceed::healthy("alpha"));
    let chain = MiddlewareChain::new()
        .with(RetryMiddleware::new(fast_retry()))
        .with(CircuitBreakerMiddleware::new(
            registry.clone(),
            BreakerLayerConfig::new(),
        ));

    let started = Instant::now();
    let err = run(&chain, ProviderSet::new().with(alpha.clone()))
        .await
        .unwrap_err();

    assert!(err.is_circuit_open(), "expected fast-fail, got {err:?}");
    assert_eq!(started.elapsed(), Duration::ZERO, "no backoff sleeps");
    assert_eq!(alpha.call_count(), 0);
}
