//! Per-call deadline.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;

use super::{Call, Completion, Middleware, Next};
use crate::telemetry;
use crate::types::CancelSignal;
use crate::{PalisadeError, Result};

/// Configuration for [`TimeoutMiddleware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Deadline for the wrapped call. Default: 30s.
    pub timeout: Duration,
    /// Fire the call's [`CancelSignal`] when the deadline passes. Default: true.
    pub signal_cancellation: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            signal_cancellation: true,
        }
    }
}

impl TimeoutConfig {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn signal_cancellation(mut self, enabled: bool) -> Self {
        self.signal_cancellation = enabled;
        self
    }
}

/// Races the rest of the chain against a deadline.
///
/// On expiry the inner future is dropped, the call's cancel signal fires
/// (if enabled), and the layer fails with [`PalisadeError::Timeout`]. The
/// timer is dropped with the race on either outcome.
#[derive(Debug, Clone)]
pub struct TimeoutMiddleware {
    config: TimeoutConfig,
}

impl TimeoutMiddleware {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &str {
        "timeout"
    }

    async fn handle(&self, mut call: Call, next: Next<'_>) -> Result<Completion> {
        let started = Instant::now();
        let provider = call.context.provider.clone();
        let trigger = if self.config.signal_cancellation {
            let (trigger, signal) = CancelSignal::pair();
            call.context = call.context.with_cancel(signal);
            Some(trigger)
        } else {
            None
        };

        match tokio::time::timeout(self.config.timeout, next.run(call)).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(trigger) = trigger {
                    trigger.send_replace(true);
                }
                let elapsed = started.elapsed();
                warn!(
                    provider = %provider,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "call timed out"
                );
                metrics::counter!(telemetry::TIMEOUTS_TOTAL, "provider" => provider).increment(1);
                Err(PalisadeError::Timeout { elapsed })
            }
        }
    }
}
