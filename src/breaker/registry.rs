//! Lazily populated set of per-provider breakers.
//!
//! One [`CircuitBreakerRegistry`] is built at startup and shared (via `Arc`)
//! with every layer that needs breaker state. Breakers are created on first
//! use of a provider id and are never removed, only reset.
//!
//! # Notifications
//!
//! Breaker events fan out two ways:
//! - [`BreakerObserver`]s registered with [`add_observer`](CircuitBreakerRegistry::add_observer)
//!   are called synchronously, in registration order, for every event.
//! - [`subscribe`](CircuitBreakerRegistry::subscribe) hands out a stream fed
//!   by an unbounded channel; nothing is dropped while the stream is alive.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{BreakerEvent, BreakerMetrics, CircuitBreaker, CircuitBreakerConfig, CircuitState};

/// Receives breaker events synchronously.
pub trait BreakerObserver: Send + Sync {
    fn on_breaker_event(&self, event: &BreakerEvent);
}

/// Fan-out point for breaker events.
#[derive(Default)]
pub struct BreakerNotifier {
    observers: RwLock<Vec<Arc<dyn BreakerObserver>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BreakerEvent>>>,
}

impl BreakerNotifier {
    pub fn add_observer(&self, observer: Arc<dyn BreakerObserver>) {
        self.observers.write().push(observer);
    }

    pub fn subscribe(&self) -> UnboundedReceiverStream<BreakerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        UnboundedReceiverStream::new(rx)
    }

    pub(crate) fn publish(&self, event: BreakerEvent) {
        for observer in self.observers.read().iter() {
            observer.on_breaker_event(&event);
        }
        // Closed receivers are pruned as they are discovered.
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Registry of per-provider circuit breakers.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    notifier: Arc<BreakerNotifier>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers use `config`.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            default_config: config,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
            notifier: Arc::new(BreakerNotifier::default()),
        }
    }

    /// Use `config` for breakers of `provider` instead of the default.
    ///
    /// Applies to breakers created after this call.
    pub fn with_provider_config(
        mut self,
        provider: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.overrides.insert(provider.into(), config);
        self
    }

    /// The breaker for `provider`, created on first use.
    pub fn get(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(provider) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(provider.to_string()).or_insert_with(|| {
            let config = self
                .overrides
                .get(provider)
                .cloned()
                .unwrap_or_else(|| self.default_config.clone());
            Arc::new(CircuitBreaker::with_notifier(
                provider,
                config,
                Arc::clone(&self.notifier),
            ))
        }))
    }

    /// Whether a call to `provider` would currently be admitted.
    pub fn is_available(&self, provider: &str) -> bool {
        self.get(provider).is_available()
    }

    /// `providers` filtered to those that would currently admit a call,
    /// preserving order.
    pub fn available_providers(&self, providers: &[String]) -> Vec<String> {
        providers
            .iter()
            .filter(|p| self.is_available(p))
            .cloned()
            .collect()
    }

    /// Current state of `provider`'s breaker (closed if never used).
    pub fn state(&self, provider: &str) -> CircuitState {
        self.breakers
            .read()
            .get(provider)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// States of every breaker created so far.
    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .read()
            .iter()
            .map(|(name, b)| (name.clone(), b.state()))
            .collect()
    }

    /// Counters for `provider`, if its breaker exists.
    pub fn metrics(&self, provider: &str) -> Option<BreakerMetrics> {
        self.breakers.read().get(provider).map(|b| b.metrics())
    }

    /// Counters for every breaker.
    pub fn all_metrics(&self) -> Vec<BreakerMetrics> {
        let mut all: Vec<_> = self.breakers.read().values().map(|b| b.metrics()).collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }

    /// Reset `provider`'s breaker to closed.
    pub fn reset(&self, provider: &str) {
        if let Some(breaker) = self.breakers.read().get(provider) {
            breaker.reset();
        }
    }

    /// Reset every breaker.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    /// Register a synchronous observer for every breaker's events.
    pub fn add_observer(&self, observer: Arc<dyn BreakerObserver>) {
        self.notifier.add_observer(observer);
    }

    /// Stream of every breaker event published after this call.
    pub fn subscribe(&self) -> UnboundedReceiverStream<BreakerEvent> {
        self.notifier.subscribe()
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("default_config", &self.default_config)
            .field("breakers", &self.states())
            .finish()
    }
}
