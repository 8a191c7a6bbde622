//! Named provider collection and the dispatching terminal.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{CacheKey, Provider};
use crate::middleware::{Call, Terminal};
use crate::types::{GenerateOptions, GenerateRequest, GenerateResponse};
use crate::{PalisadeError, Result};

/// Providers keyed by [`Provider::name`].
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous one with the same name.
    pub fn add(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_owned(), provider);
    }

    /// Builder-style [`add`](Self::add).
    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.add(provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Cache key for `provider`, using its own keying when registered.
    pub fn cache_key(
        &self,
        provider: &str,
        request: &GenerateRequest,
        options: &GenerateOptions,
    ) -> CacheKey {
        match self.providers.get(provider) {
            Some(p) => p.cache_key(request, options),
            None => CacheKey::new(provider, request, options),
        }
    }

    /// Terminal that dispatches each call to its context's provider.
    pub fn terminal(self: &Arc<Self>) -> ProviderTerminal {
        ProviderTerminal {
            providers: Arc::clone(self),
        }
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("providers", &self.names())
            .finish()
    }
}

/// [`Terminal`] backed by a [`ProviderSet`].
#[derive(Debug, Clone)]
pub struct ProviderTerminal {
    providers: Arc<ProviderSet>,
}

#[async_trait]
impl Terminal for ProviderTerminal {
    async fn invoke(&self, call: &Call) -> Result<GenerateResponse> {
        let provider = self
            .providers
            .get(&call.context.provider)
            .ok_or(PalisadeError::NoProvider)?;
        provider.generate(&call.request, &call.options).await
    }
}
