//! Palisade - resilience pipeline for text-generation providers
//!
//! This crate wraps unreliable generation backends in composable layers:
//! timeouts, classified retries with backoff, per-provider circuit breakers,
//! cache-backed graceful degradation, input/output sanitization, and
//! structured telemetry with provider health scoring.
//!
//! Providers implement the [`Provider`] trait. The layers live in
//! [`middleware`] and compose through a [`MiddlewareChain`];
//! [`PipelineBuilder`] assembles them in the canonical order.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use palisade::{
//!     CircuitBreakerConfig, GenerateOptions, GenerateRequest, GenerateResponse, Pipeline,
//!     Provider,
//! };
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Provider for Echo {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn generate(
//!         &self,
//!         request: &GenerateRequest,
//!         _options: &GenerateOptions,
//!     ) -> palisade::Result<GenerateResponse> {
//!         Ok(GenerateResponse::new("echo", request.prompt.clone()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> palisade::Result<()> {
//!     let pipeline = Pipeline::builder()
//!         .provider(Arc::new(Echo))
//!         .breaker(CircuitBreakerConfig::new().failure_threshold(30.0))
//!         .build()?;
//!
//!     let response = pipeline
//!         .generate(GenerateRequest::new("hello"), GenerateOptions::default())
//!         .await?;
//!     println!("{} (degraded: {})", response.text, response.fallback.is_degraded());
//!     Ok(())
//! }
//! ```

pub mod breaker;
pub mod cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod middleware;
pub mod pipeline;
pub mod providers;
pub mod strategy;
pub mod telemetry;
pub mod types;
pub mod version;

// Re-export main types at crate root
pub use error::{PalisadeError, Result, SanitizeKind};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use providers::{CacheKey, Provider, ProviderSet};
pub use strategy::ProviderStrategy;
pub use version::{PKG_VERSION, version_string};

pub use breaker::{
    BreakerEvent, BreakerMetrics, BreakerObserver, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitState,
};
pub use cache::{CacheConfig, CacheStats, ResponseCache};
pub use classify::{ErrorCategory, ErrorClassifier};
pub use config::Config;
pub use middleware::{
    BackoffStrategy, BreakerLayerConfig, FallbackConfig, MiddlewareChain, RetryConfig,
    SanitizeConfig, TimeoutConfig,
};
pub use telemetry::{HealthScorer, TelemetryConfig, TelemetryEvent, TelemetryLogger};
pub use types::{
    FallbackMetadata, GenerateOptions, GenerateRequest, GenerateResponse, OperationContext,
    OperationKind,
};
