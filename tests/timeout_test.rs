use std::sync::{Arc, Mutex};
use std::time::Duration;

use palisade::middleware::{Call, TimeoutMiddleware, terminal_fn};
use palisade::{
    GenerateOptions, GenerateRequest, GenerateResponse, MiddlewareChain, OperationContext,
    OperationKind, PalisadeError, TimeoutConfig,
};
use tokio::sync::oneshot;
use tokio::time::Instant;

fn slow_terminal(delay: Duration) -> impl palisade::middleware::Terminal {
    terminal_fn(move |call: Call| async move {
        tokio::time::sleep(delay).await;
        Ok(GenerateResponse::new(call.context.provider, "late"))
    })
}

fn context() -> OperationContext {
    OperationContext::new(OperationKind::Generate, "alpha")
}

#[tokio::test(start_paused = true)]
async fn fast_call_passes_through() {
    let chain = MiddlewareChain::new()
        .with(TimeoutMiddleware::new(TimeoutConfig::new(Duration::from_secs(5))));

    let done = chain
        .execute(
            GenerateRequest::new("hi"),
            GenerateOptions::default(),
            context(),
            &slow_terminal(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(done.response.text, "late");
    assert!(done.context.cancel.is_some());
}

#[tokio::test(start_paused = true)]
async fn slow_call_fails_at_deadline() {
    let chain = MiddlewareChain::new()
        .with(TimeoutMiddleware::new(TimeoutConfig::new(Duration::from_secs(2))));

    let started = Instant::now();
    let err = chain
        .execute(
            GenerateRequest::new("hi"),
            GenerateOptions::default(),
            context(),
            &slow_terminal(Duration::from_secs(60)),
        )
        .await
        .unwrap_err();

    match err {
        PalisadeError::Timeout { elapsed } => assert_eq!(elapsed, Duration::from_secs(2)),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn deadline_fires_cancellation_signal() {
    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let terminal = terminal_fn(move |call: Call| {
        let tx = tx.clone();
        async move {
            let signal = call.context.cancel.clone().expect("timeout layer sets a signal");
            tokio::spawn(async move {
                signal.cancelled().await;
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            });
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(GenerateResponse::new(call.context.provider, "late"))
        }
    });
    let chain = MiddlewareChain::new()
        .with(TimeoutMiddleware::new(TimeoutConfig::new(Duration::from_secs(1))));

    let err = chain
        .execute(
            GenerateRequest::new("hi"),
            GenerateOptions::default(),
            context(),
            &terminal,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PalisadeError::Timeout { .. }));

    tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .expect("in-flight work observed cancellation")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn signal_can_be_disabled() {
    let chain = MiddlewareChain::new().with(TimeoutMiddleware::new(
        TimeoutConfig::new(Duration::from_secs(5)).signal_cancellation(false),
    ));

    let done = chain
        .execute(
            GenerateRequest::new("hi"),
            GenerateOptions::default(),
            context(),
            &slow_terminal(Duration::ZERO),
        )
        .await
        .unwrap();

    assert!(done.context.cancel.is_none());
}

#[tokio::test(start_paused = true)]
async fn pending_until_the_deadline() {
    use tokio_test::{assert_pending, assert_ready_err, task};

    let chain = MiddlewareChain::new()
        .with(TimeoutMiddleware::new(TimeoutConfig::new(Duration::from_secs(2))));
    let terminal = slow_terminal(Duration::from_secs(60));

    let mut call = task::spawn(chain.execute(
        GenerateRequest::new("hi"),
        GenerateOptions::default(),
        context(),
        &terminal,
    ));
    assert_pending!(call.poll());

    tokio::time::advance(Duration::from_millis(1999)).await;
    assert_pending!(call.poll());

    tokio::time::advance(Duration::from_millis(1)).await;
    let err = assert_ready_err!(call.poll());
    assert!(matches!(err, PalisadeError::Timeout { .. }));
}
