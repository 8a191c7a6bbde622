//! Provider trait and cache-key derivation.
//!
//! A provider performs the network call for a single vendor and parses the
//! vendor payload into a [`GenerateResponse`]. Failures are reported as
//! [`PalisadeError::Provider`](crate::PalisadeError::Provider) with the
//! vendor's message intact, since the retry and fallback classifiers match
//! against that text.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use serde::Serialize;

use crate::Result;
use crate::types::{GenerateOptions, GenerateRequest, GenerateResponse};

/// Deterministic cache key for one logical request against one provider.
///
/// Built from the provider id, the serialised request, and the serialised
/// generation options. The same logical request always maps to the same key
/// within a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    provider: String,
    digest: u64,
}

impl CacheKey {
    /// Derive the key for `request` + `options` against `provider`.
    pub fn new(provider: &str, request: &GenerateRequest, options: &GenerateOptions) -> Self {
        let mut hasher = DefaultHasher::new();
        provider.hash(&mut hasher);
        serialized(request).hash(&mut hasher);
        serialized(options).hash(&mut hasher);
        Self {
            provider: provider.to_string(),
            digest: hasher.finish(),
        }
    }

    /// Provider this key belongs to.
    pub fn provider(&self) -> &str {
        &self.provider
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:016x}", self.provider, self.digest)
    }
}

/// JSON form of a value, falling back to its debug form if serde refuses it.
fn serialized<T: Serialize + fmt::Debug>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
}

/// A text-generation provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider id for routing, breakers, and telemetry.
    fn name(&self) -> &str;

    /// Perform one generation call.
    async fn generate(
        &self,
        request: &GenerateRequest,
        options: &GenerateOptions,
    ) -> Result<GenerateResponse>;

    /// Cache key for a request against this provider.
    fn cache_key(&self, request: &GenerateRequest, options: &GenerateOptions) -> CacheKey {
        CacheKey::new(self.name(), request, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerateRequest {
        GenerateRequest::new("summarise the week")
    }

    #[test]
    fn cache_key_deterministic() {
        let options = GenerateOptions::new("m").temperature(0.2);
        let k1 = CacheKey::new("alpha", &request(), &options);
        let k2 = CacheKey::new("alpha", &request(), &options);
        assert_eq!(k1, k2);
    }

    #[test]
    fn cache_key_differs_on_provider() {
        let options = GenerateOptions::new("m");
        assert_ne!(
            CacheKey::new("alpha", &request(), &options),
            CacheKey::new("beta", &request(), &options)
        );
    }

    #[test]
    fn cache_key_differs_on_temperature() {
        let k1 = CacheKey::new("alpha", &request(), &GenerateOptions::new("m").temperature(0.2));
        let k2 = CacheKey::new("alpha", &request(), &GenerateOptions::new("m").temperature(0.9));
        assert_ne!(k1, k2);
    }

    #[test]
    fn cache_key_differs_on_request() {
        let options = GenerateOptions::new("m");
        let other = GenerateRequest::new("summarise the month");
        assert_ne!(
            CacheKey::new("alpha", &request(), &options),
            CacheKey::new("alpha", &other, &options)
        );
    }
}
