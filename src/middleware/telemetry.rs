//! Per-attempt call recording.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::{Call, Completion, Middleware, Next};
use crate::PalisadeError;
use crate::Result;
use crate::classify::ErrorClassifier;
use crate::telemetry::{self, EventKind, EventStatus, TelemetryEvent, TelemetryLogger};

/// Records one [`EventKind::ProviderCall`] event per pass through the layer.
///
/// Placed inside the retry layer, every attempt is recorded separately.
/// Failures carry the classifier's category in `metadata.category`; timeouts
/// additionally emit an [`EventKind::Timeout`] event.
pub struct TelemetryMiddleware {
    logger: Arc<TelemetryLogger>,
    classifier: ErrorClassifier,
}

impl TelemetryMiddleware {
    pub fn new(logger: Arc<TelemetryLogger>) -> Self {
        Self {
            logger,
            classifier: ErrorClassifier::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn logger(&self) -> &Arc<TelemetryLogger> {
        &self.logger
    }
}

#[async_trait]
impl Middleware for TelemetryMiddleware {
    fn name(&self) -> &str {
        "telemetry"
    }

    async fn handle(&self, call: Call, next: Next<'_>) -> Result<Completion> {
        let started = Instant::now();
        let provider = call.context.provider.clone();
        let operation = call.context.kind.to_string();
        let attempt = call.context.attempt;

        let result = next.run(call).await;
        let elapsed = started.elapsed();

        let (status, outcome) = match &result {
            Ok(_) => (EventStatus::Success, "ok"),
            Err(_) => (EventStatus::Failure, "error"),
        };
        metrics::counter!(telemetry::REQUESTS_TOTAL,
            "provider" => provider.clone(),
            "operation" => operation.clone(),
            "status" => outcome,
        )
        .increment(1);
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
            "provider" => provider.clone(),
            "operation" => operation.clone(),
        )
        .record(elapsed.as_secs_f64());

        let mut event = TelemetryEvent::new(EventKind::ProviderCall, status, provider.as_str())
            .operation(operation.as_str())
            .duration(elapsed)
            .meta("attempt", attempt);
        if let Err(e) = &result {
            let class = self.classifier.classify(e);
            event = event
                .error(e)
                .meta("category", class.category.as_str())
                .meta("retryable", class.retryable);
            if matches!(e, PalisadeError::Timeout { .. }) {
                self.logger.log_event(
                    TelemetryEvent::new(EventKind::Timeout, EventStatus::Failure, provider.as_str())
                        .operation(operation.as_str())
                        .duration(elapsed)
                        .meta("attempt", attempt),
                );
            }
        }
        debug!(
            provider = %provider,
            attempt,
            duration_ms = elapsed.as_millis() as u64,
            outcome,
            "provider call finished"
        );
        self.logger.log_event(event);
        result
    }
}
