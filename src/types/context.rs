//! Per-call operation context.
//!
//! An [`OperationContext`] describes one logical call as it travels through
//! the middleware chain. It is a value: layers derive a new context with the
//! `with_*` methods and hand it to the next step instead of mutating shared
//! state, and the context that produced the final response travels back up
//! inside the [`Completion`](crate::middleware::Completion).

use std::fmt;

use tokio::sync::watch;
use tokio::time::Instant;

/// What kind of logical operation a call performs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Free-form text generation.
    Generate,
    /// Structured insight derived from supplied data.
    Insight,
    /// Summarisation of supplied context.
    Summary,
    /// Caller-defined operation.
    Custom(String),
}

impl OperationKind {
    /// Stable label used in telemetry and metrics.
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Generate => "generate",
            OperationKind::Insight => "insight",
            OperationKind::Summary => "summary",
            OperationKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory cancellation signal observed by in-flight operations.
///
/// Set by the timeout layer when its deadline fires. Operations may ignore it;
/// the timeout layer fails the call either way.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Create a linked trigger/signal pair.
    pub(crate) fn pair() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Never resolves if the trigger
    /// is dropped without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// State of one logical call.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Kind of operation.
    pub kind: OperationKind,
    /// When the logical call started.
    pub started_at: Instant,
    /// 1-based attempt number of the current try.
    pub attempt: u32,
    /// Provider the current try targets.
    pub provider: String,
    /// Message of the most recent failure in this call.
    pub last_error: Option<String>,
    /// Cancellation signal for the current try, if a timeout layer set one.
    pub cancel: Option<CancelSignal>,
}

impl OperationContext {
    /// Start a new context for `provider`.
    pub fn new(kind: OperationKind, provider: impl Into<String>) -> Self {
        Self {
            kind,
            started_at: Instant::now(),
            attempt: 1,
            provider: provider.into(),
            last_error: None,
            cancel: None,
        }
    }

    /// Derive a context targeting another provider.
    pub fn with_provider(&self, provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..self.clone()
        }
    }

    /// Derive a context for the given attempt number.
    pub fn with_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    /// Derive a context remembering `error` as the last failure.
    pub fn with_last_error(&self, error: &impl fmt::Display) -> Self {
        Self {
            last_error: Some(error.to_string()),
            ..self.clone()
        }
    }

    /// Derive a context carrying a cancellation signal.
    pub fn with_cancel(&self, cancel: CancelSignal) -> Self {
        Self {
            cancel: Some(cancel),
            ..self.clone()
        }
    }

    /// Time since the logical call started.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}
