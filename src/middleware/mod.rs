//! Middleware composition.
//!
//! A [`MiddlewareChain`] is an ordered list of layers around a [`Terminal`]
//! (the actual provider call). Each layer receives the [`Call`] and a
//! [`Next`] continuation standing for "the rest of the chain":
//!
//! ```text
//!   execute(call)
//!        │
//!        ▼
//!   layer 0 ──next.run()──► layer 1 ──next.run()──► … ──► terminal
//!        ▲                     │                            │
//!        └──── Result<Completion> unwinds inner → outer ◄───┘
//! ```
//!
//! A layer calls `next.run()` once on the happy path, may call it again
//! (retry, alternate providers), may recover from its error, or may skip it
//! entirely to short-circuit. The chain enforces no ordering between layers;
//! [`PipelineBuilder`](crate::PipelineBuilder) assembles the canonical order.
//!
//! The call's [`OperationContext`] is threaded by value. Layers derive a new
//! context (`ctx.with_provider(..)`) for the inner call instead of mutating
//! shared state, and the context that produced the response comes back in
//! the [`Completion`].

pub mod circuit_breaker;
pub mod fallback;
pub mod retry;
pub mod sanitize;
pub mod telemetry;
pub mod timeout;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tracing::instrument;

pub use circuit_breaker::{BreakerLayerConfig, CircuitBreakerMiddleware};
pub use fallback::{FallbackConfig, FallbackMiddleware};
pub use retry::{BackoffStrategy, RetryConfig, RetryMiddleware};
pub use sanitize::{ContentPolicy, RedactionRule, SanitizeConfig, SanitizeMiddleware};
pub use telemetry::TelemetryMiddleware;
pub use timeout::{TimeoutConfig, TimeoutMiddleware};

use crate::types::{GenerateOptions, GenerateRequest, GenerateResponse, OperationContext};
use crate::{PalisadeError, Result};

/// One logical call travelling through the chain.
#[derive(Debug, Clone)]
pub struct Call {
    pub request: GenerateRequest,
    pub options: GenerateOptions,
    pub context: OperationContext,
}

impl Call {
    pub fn new(request: GenerateRequest, options: GenerateOptions, context: OperationContext) -> Self {
        Self {
            request,
            options,
            context,
        }
    }

    /// Same request and options under a different context.
    pub fn with_context(&self, context: OperationContext) -> Self {
        Self {
            request: self.request.clone(),
            options: self.options.clone(),
            context,
        }
    }
}

/// Successful outcome of a call: the response plus the context that produced it.
#[derive(Debug, Clone)]
pub struct Completion {
    pub response: GenerateResponse,
    pub context: OperationContext,
}

/// The innermost step of a chain: performs the actual provider call.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn invoke(&self, call: &Call) -> Result<GenerateResponse>;
}

/// [`Terminal`] backed by a closure. See [`terminal_fn`].
pub struct FnTerminal<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Terminal for FnTerminal<F>
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GenerateResponse>> + Send + 'static,
{
    async fn invoke(&self, call: &Call) -> Result<GenerateResponse> {
        (self.f)(call.clone()).await
    }
}

/// Build a terminal from a closure taking the call by value.
///
/// ```rust
/// use palisade::middleware::{terminal_fn, Call};
/// use palisade::GenerateResponse;
///
/// let terminal = terminal_fn(|call: Call| async move {
///     Ok(GenerateResponse::new(call.context.provider.clone(), "hello"))
/// });
/// # let _ = terminal;
/// ```
pub fn terminal_fn<F, Fut>(f: F) -> FnTerminal<F>
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GenerateResponse>> + Send + 'static,
{
    FnTerminal { f }
}

/// A single middleware layer.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Layer name for logging.
    fn name(&self) -> &str;

    /// Handle `call`, delegating to `next` for the rest of the chain.
    async fn handle(&self, call: Call, next: Next<'_>) -> Result<Completion>;
}

/// Continuation representing the remainder of a chain.
///
/// `Next` is `Copy`, so a layer may run the remainder more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    /// Continuation over `layers` ending in `terminal`.
    pub fn new(layers: &'a [Arc<dyn Middleware>], terminal: &'a dyn Terminal) -> Self {
        Self {
            rest: layers,
            terminal,
        }
    }

    /// Run the rest of the chain for `call`.
    pub fn run(self, call: Call) -> BoxFuture<'a, Result<Completion>> {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((layer, rest)) => {
                    let next = Next {
                        rest,
                        terminal: self.terminal,
                    };
                    layer.handle(call, next).await
                }
                None => {
                    let response = self.terminal.invoke(&call).await?;
                    Ok(Completion {
                        response,
                        context: call.context,
                    })
                }
            }
        })
    }

    /// Number of layers still ahead of the terminal.
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }
}

/// Ordered middleware composition.
///
/// The first layer added is the outermost.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Create an empty chain (calls go straight to the terminal).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer inside every layer added so far.
    pub fn with(mut self, layer: impl Middleware + 'static) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    /// Append a shared layer.
    pub fn push(&mut self, layer: Arc<dyn Middleware>) {
        self.layers.push(layer);
    }

    /// Layer names, outermost first.
    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Execute a call through every layer and the terminal.
    ///
    /// A raw provider error that no layer converted is reported as a
    /// [`PalisadeError::Retry`] carrying the number of provider calls made,
    /// so callers only ever see the typed resilience errors.
    #[instrument(skip_all, fields(operation = %context.kind, provider = %context.provider))]
    pub async fn execute(
        &self,
        request: GenerateRequest,
        options: GenerateOptions,
        context: OperationContext,
        terminal: &dyn Terminal,
    ) -> Result<Completion> {
        let counted = Counted {
            inner: terminal,
            calls: AtomicU32::new(0),
        };
        let call = Call::new(request, options, context);
        match Next::new(&self.layers, &counted).run(call).await {
            Err(e @ PalisadeError::Provider { .. }) => Err(PalisadeError::Retry {
                attempts: counted.calls.load(Ordering::Relaxed).max(1),
                last_delay: Duration::ZERO,
                source: Box::new(e),
            }),
            other => other,
        }
    }
}

/// Terminal wrapper counting provider invocations for one execution.
struct Counted<'a> {
    inner: &'a dyn Terminal,
    calls: AtomicU32,
}

#[async_trait]
impl<'a> Terminal for Counted<'a> {
    async fn invoke(&self, call: &Call) -> Result<GenerateResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.inner.invoke(call).await
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("layers", &self.layer_names())
            .finish()
    }
}
