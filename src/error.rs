//! Palisade error types

use std::fmt;
use std::time::Duration;

/// Category of a sanitization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanitizeKind {
    /// Personally identifying information in content.
    Pii,
    /// Protected health information (patient ids, record numbers, codes).
    Hipaa,
    /// Prompt-injection attempt in the request.
    Injection,
    /// Content policy violation in the response.
    Policy,
    /// Request failed structural validation (size, language, ...).
    Validation,
}

impl fmt::Display for SanitizeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SanitizeKind::Pii => "pii",
            SanitizeKind::Hipaa => "hipaa",
            SanitizeKind::Injection => "injection",
            SanitizeKind::Policy => "policy",
            SanitizeKind::Validation => "validation",
        };
        f.write_str(s)
    }
}

/// Palisade error types
#[derive(Debug, thiserror::Error)]
pub enum PalisadeError {
    /// Input rejected before any provider call was made.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Raw error reported by a provider collaborator.
    ///
    /// Middleware classifies these by message and status. They are wrapped in
    /// one of the typed resilience errors before reaching the caller.
    #[error("provider '{provider}' failed: {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Every retry attempt failed.
    #[error("all {attempts} attempts failed (last delay {last_delay:?}): {source}")]
    Retry {
        attempts: u32,
        last_delay: Duration,
        #[source]
        source: Box<PalisadeError>,
    },

    /// Breaker rejected the call, or every provider in the try-order failed.
    #[error("circuit breaker rejected call to provider '{provider}'")]
    CircuitBreaker {
        provider: String,
        #[source]
        source: Option<Box<PalisadeError>>,
    },

    /// Every fallback tier was exhausted.
    #[error("all fallback tiers failed after {attempts} attempts (cache consulted: {cache_consulted}): {source}")]
    Fallback {
        attempts: u32,
        cache_consulted: bool,
        #[source]
        source: Box<PalisadeError>,
    },

    #[error("operation timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("sanitization failed ({kind}): {message}")]
    Sanitize { kind: SanitizeKind, message: String },

    #[error("no provider configured")]
    NoProvider,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PalisadeError {
    /// Shorthand for a provider error without status or retry hint.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        PalisadeError::Provider {
            provider: provider.into(),
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Provider error carrying an HTTP-like status code.
    pub fn provider_status(
        provider: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        PalisadeError::Provider {
            provider: provider.into(),
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Whether this is a fast-fail rejection from an open breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, PalisadeError::CircuitBreaker { source: None, .. })
    }

    /// Status code of the innermost provider error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            PalisadeError::Provider { status, .. } => *status,
            PalisadeError::Retry { source, .. } | PalisadeError::Fallback { source, .. } => {
                source.status()
            }
            PalisadeError::CircuitBreaker {
                source: Some(source),
                ..
            } => source.status(),
            _ => None,
        }
    }

    /// Provider hint for how long to wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PalisadeError::Provider { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Provider named by this error, if any.
    pub fn provider_name(&self) -> Option<&str> {
        match self {
            PalisadeError::Provider { provider, .. }
            | PalisadeError::CircuitBreaker { provider, .. } => Some(provider),
            PalisadeError::Retry { source, .. } | PalisadeError::Fallback { source, .. } => {
                source.provider_name()
            }
            _ => None,
        }
    }

    /// Whether this error belongs to the user-visible taxonomy.
    ///
    /// Raw provider errors and bare configuration errors are not typed
    /// resilience outcomes.
    pub fn is_typed(&self) -> bool {
        !matches!(self, PalisadeError::Provider { .. })
    }
}

/// Result type alias for Palisade operations
pub type Result<T> = std::result::Result<T, PalisadeError>;
