//! TOML configuration.
//!
//! Configuration is loaded with the following resolution order:
//! 1. An explicit path (e.g. `--config <path>`)
//! 2. `~/.palisade/config.toml` (user)
//! 3. `/etc/palisade/config.toml` (system)
//!
//! Every section is optional; missing fields take the runtime defaults.
//! Durations are written in milliseconds (`*_ms`). Each section converts to
//! its runtime config with a `to_*` method that validates ranges.
//!
//! ```toml
//! [pipeline]
//! primary = "alpha"
//! fallback_providers = ["beta"]
//!
//! [breaker]
//! failure_threshold = 50.0
//! minimum_requests = 5
//! reset_timeout_ms = 30000
//!
//! [breaker.providers.beta]
//! failure_threshold = 80.0
//!
//! [retry]
//! max_attempts = 3
//! backoff = "exponential"
//!
//! [retry.provider_switch]
//! rate_limit = ["beta"]
//!
//! [[classify.rules]]
//! category = "rate_limit"
//! retryable = true
//! pattern = "quota"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::breaker::CircuitBreakerConfig;
use crate::cache::CacheConfig;
use crate::classify::{ClassificationRule, ErrorCategory, ErrorClassifier};
use crate::middleware::{
    BackoffStrategy, ContentPolicy, FallbackConfig, RedactionRule, RetryConfig, SanitizeConfig,
    TimeoutConfig,
};
use crate::telemetry::TelemetryConfig;
use crate::{PalisadeError, Result};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub timeout: TimeoutSection,
    #[serde(default)]
    pub fallback: FallbackSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub sanitize: SanitizeSection,
    #[serde(default)]
    pub classify: ClassifySection,
}

/// Provider selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineSection {
    /// Provider tried first. Defaults to the first registered provider.
    #[serde(default)]
    pub primary: Option<String>,
    /// Alternate providers, in order.
    #[serde(default)]
    pub fallback_providers: Vec<String>,
}

/// Breaker thresholds. Unset fields keep the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakerSection {
    #[serde(flatten)]
    pub defaults: BreakerValues,
    /// Per-provider overrides, layered on top of `defaults`.
    #[serde(default)]
    pub providers: BTreeMap<String, BreakerValues>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakerValues {
    /// Failure rate (percent) that trips the breaker.
    pub failure_threshold: Option<f64>,
    pub minimum_requests: Option<u64>,
    pub reset_timeout_ms: Option<u64>,
    pub half_open_max_requests: Option<u32>,
    pub success_threshold: Option<u32>,
}

impl BreakerValues {
    fn apply(&self, mut config: CircuitBreakerConfig) -> Result<CircuitBreakerConfig> {
        if let Some(t) = self.failure_threshold {
            if !(0.0..=100.0).contains(&t) || t == 0.0 {
                return Err(PalisadeError::Configuration(format!(
                    "breaker failure_threshold must be in (0, 100], got {t}"
                )));
            }
            config = config.failure_threshold(t);
        }
        if let Some(n) = self.minimum_requests {
            config = config.minimum_requests(n);
        }
        if let Some(ms) = self.reset_timeout_ms {
            config = config.reset_timeout(Duration::from_millis(ms));
        }
        if let Some(n) = self.half_open_max_requests {
            if n == 0 {
                return Err(PalisadeError::Configuration(
                    "breaker half_open_max_requests must be at least 1".into(),
                ));
            }
            config = config.half_open_max_requests(n);
        }
        if let Some(n) = self.success_threshold {
            config = config.success_threshold(n);
        }
        Ok(config)
    }
}

impl BreakerSection {
    /// Default breaker config.
    pub fn to_breaker_config(&self) -> Result<CircuitBreakerConfig> {
        self.defaults.apply(CircuitBreakerConfig::default())
    }

    /// Per-provider configs, each layered over the defaults.
    pub fn provider_overrides(&self) -> Result<Vec<(String, CircuitBreakerConfig)>> {
        let base = self.to_breaker_config()?;
        self.providers
            .iter()
            .map(|(name, values)| Ok((name.clone(), values.apply(base.clone())?)))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_true")]
    pub jitter: bool,
    /// Error category name → providers to move to after that failure.
    #[serde(default)]
    pub provider_switch: HashMap<String, Vec<String>>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: BackoffStrategy::default(),
            jitter: true,
            provider_switch: HashMap::new(),
        }
    }
}

impl RetrySection {
    pub fn to_retry_config(&self) -> Result<RetryConfig> {
        if self.max_attempts == 0 {
            return Err(PalisadeError::Configuration(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(PalisadeError::Configuration(format!(
                "retry initial_delay_ms ({}) exceeds max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        let mut config = RetryConfig::new()
            .max_attempts(self.max_attempts)
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .backoff(self.backoff)
            .jitter(self.jitter);
        for (category, providers) in &self.provider_switch {
            config = config.switch_on(category.parse()?, providers.clone());
        }
        Ok(config)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub signal_cancellation: bool,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_timeout_ms(),
            signal_cancellation: true,
        }
    }
}

impl TimeoutSection {
    pub fn to_timeout_config(&self) -> Result<TimeoutConfig> {
        if self.timeout_ms == 0 {
            return Err(PalisadeError::Configuration(
                "timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(TimeoutConfig::new(Duration::from_millis(self.timeout_ms))
            .signal_cancellation(self.signal_cancellation))
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Race deadline for each live attempt. 0 disables it.
    #[serde(default = "default_timeout_ms")]
    pub primary_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub cache_results: bool,
    #[serde(default)]
    pub cache_ttl_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default = "default_max_cache_age_ms")]
    pub max_cache_age_ms: u64,
    #[serde(default)]
    pub cached_message: Option<String>,
    #[serde(default)]
    pub provider_message: Option<String>,
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            enabled: true,
            primary_timeout_ms: default_timeout_ms(),
            cache_results: true,
            cache_ttl_ms: None,
            use_cache: true,
            max_cache_age_ms: default_max_cache_age_ms(),
            cached_message: None,
            provider_message: None,
        }
    }
}

impl FallbackSection {
    /// Runtime config. Alternate providers come from `[pipeline]`.
    pub fn to_fallback_config(&self, fallback_providers: Vec<String>) -> FallbackConfig {
        let primary_timeout =
            (self.primary_timeout_ms > 0).then(|| Duration::from_millis(self.primary_timeout_ms));
        let mut config = FallbackConfig::new()
            .primary_timeout(primary_timeout)
            .fallback_providers(fallback_providers)
            .cache_results(self.cache_results)
            .use_cache(self.use_cache)
            .max_cache_age(Duration::from_millis(self.max_cache_age_ms));
        if let Some(ms) = self.cache_ttl_ms {
            config = config.cache_ttl(Duration::from_millis(ms));
        }
        if let Some(message) = &self.cached_message {
            config = config.cached_message(message.clone());
        }
        if let Some(message) = &self.provider_message {
            config = config.provider_message(message.clone());
        }
        config
    }
}

fn default_max_cache_age_ms() -> u64 {
    15 * 60 * 1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            ttl_ms: default_ttl_ms(),
        }
    }
}

impl CacheSection {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .max_entries(self.max_entries)
            .ttl(Duration::from_millis(self.ttl_ms))
    }
}

fn default_max_entries() -> u64 {
    10_000
}

fn default_ttl_ms() -> u64 {
    3_600_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySection {
    /// Record per-attempt events in the pipeline.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_events: default_max_events(),
        }
    }
}

impl TelemetrySection {
    pub fn to_telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig::new().max_events(self.max_events)
    }
}

fn default_max_events() -> usize {
    10_000
}

/// Request validation and response redaction. Disabled unless configured.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SanitizeSection {
    #[serde(default)]
    pub enabled: bool,
    pub max_prompt_chars: Option<usize>,
    pub max_context_chars: Option<usize>,
    pub max_tokens: Option<usize>,
    pub allowed_languages: Option<Vec<String>>,
    pub block_injection: Option<bool>,
    pub redact_pii: Option<bool>,
    pub redact_hipaa: Option<bool>,
    #[serde(default)]
    pub custom_patterns: Vec<PatternEntry>,
    #[serde(default)]
    pub policy: PolicySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternEntry {
    pub label: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicySection {
    pub allow_profanity: Option<bool>,
    pub allow_personal_info: Option<bool>,
    pub allow_medical_terms: Option<bool>,
    pub profanity: Option<Vec<String>>,
    pub medical_terms: Option<Vec<String>>,
}

impl SanitizeSection {
    pub fn to_sanitize_config(&self) -> Result<SanitizeConfig> {
        let mut config = SanitizeConfig::default();
        if let Some(n) = self.max_prompt_chars {
            config.max_prompt_chars = n;
        }
        if let Some(n) = self.max_context_chars {
            config.max_context_chars = n;
        }
        if let Some(n) = self.max_tokens {
            config.max_tokens = n;
        }
        if let Some(languages) = &self.allowed_languages {
            config.allowed_languages = languages.clone();
        }
        if let Some(enabled) = self.block_injection {
            config.block_injection = enabled;
        }
        if let Some(enabled) = self.redact_pii {
            config.redact_pii = enabled;
        }
        if let Some(enabled) = self.redact_hipaa {
            config.redact_hipaa = enabled;
        }
        for entry in &self.custom_patterns {
            config.custom_rules.push(RedactionRule::new(&entry.label, &entry.pattern)?);
        }

        let mut policy = ContentPolicy::default();
        let p = &self.policy;
        if let Some(v) = p.allow_profanity {
            policy.allow_profanity = v;
        }
        if let Some(v) = p.allow_personal_info {
            policy.allow_personal_info = v;
        }
        if let Some(v) = p.allow_medical_terms {
            policy.allow_medical_terms = v;
        }
        if let Some(words) = &p.profanity {
            policy.profanity = words.clone();
        }
        if let Some(terms) = &p.medical_terms {
            policy.medical_terms = terms.clone();
        }
        config.policy = policy;
        Ok(config)
    }
}

/// Extra classification rules, checked before the built-in table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassifySection {
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    pub category: ErrorCategory,
    pub retryable: bool,
    #[serde(default)]
    pub pattern: Option<String>,
    /// Inclusive HTTP status range, e.g. `[520, 529]`.
    #[serde(default)]
    pub status: Option<[u16; 2]>,
}

impl ClassifySection {
    pub fn to_classifier(&self) -> Result<ErrorClassifier> {
        let mut classifier = ErrorClassifier::default();
        // Prepend in reverse so file order is preserved at the front.
        for entry in self.rules.iter().rev() {
            let rule = match (&entry.pattern, entry.status) {
                (Some(pattern), status) => {
                    let rule = ClassificationRule::pattern(entry.category, entry.retryable, pattern)?;
                    match status {
                        Some([lo, hi]) => rule.or_status(lo..=hi),
                        None => rule,
                    }
                }
                (None, Some([lo, hi])) => {
                    ClassificationRule::status(entry.category, entry.retryable, lo..=hi)
                }
                (None, None) => {
                    return Err(PalisadeError::Configuration(format!(
                        "classification rule for {} needs a pattern or a status range",
                        entry.category.as_str()
                    )));
                }
            };
            classifier = classifier.prepend_rule(rule);
        }
        Ok(classifier)
    }
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.palisade/config.toml`
    /// 3. `/etc/palisade/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = fs::read_to_string(&path).map_err(|e| {
            PalisadeError::Configuration(format!("failed to read config file {path:?}: {e}"))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            PalisadeError::Configuration(msg) => {
                PalisadeError::Configuration(format!("{path:?}: {msg}"))
            }
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PalisadeError::Configuration(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section converts cleanly.
    pub fn validate(&self) -> Result<()> {
        self.breaker.provider_overrides()?;
        self.retry.to_retry_config()?;
        self.timeout.to_timeout_config()?;
        self.sanitize.to_sanitize_config()?;
        self.classify.to_classifier()?;
        Ok(())
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(PalisadeError::Configuration(format!(
                "config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".palisade").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/palisade/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(PalisadeError::Configuration(
            "no config file found; create ~/.palisade/config.toml or /etc/palisade/config.toml"
                .to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert!(config.pipeline.primary.is_none());
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.timeout.enabled);
        assert!(!config.sanitize.enabled);
        assert_eq!(
            config.breaker.to_breaker_config().unwrap(),
            CircuitBreakerConfig::default()
        );
    }

    #[test]
    fn breaker_overrides_layer_over_defaults() {
        let config = Config::from_toml_str(
            r#"
            [breaker]
            failure_threshold = 30.0
            minimum_requests = 3

            [breaker.providers.beta]
            failure_threshold = 80.0
        "#,
        )
        .unwrap();
        let overrides = config.breaker.provider_overrides().unwrap();
        assert_eq!(overrides.len(), 1);
        let (name, beta) = &overrides[0];
        assert_eq!(name, "beta");
        assert_eq!(beta.failure_threshold, 80.0);
        assert_eq!(beta.minimum_requests, 3);
    }

    #[test]
    fn retry_section_parses_switch_map() {
        let config = Config::from_toml_str(
            r#"
            [retry]
            max_attempts = 4
            backoff = "linear"
            jitter = false

            [retry.provider_switch]
            rate_limit = ["beta", "gamma"]
        "#,
        )
        .unwrap();
        let retry = config.retry.to_retry_config().unwrap();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.backoff, BackoffStrategy::Linear);
        assert_eq!(
            retry.provider_switch[&ErrorCategory::RateLimit],
            vec!["beta".to_string(), "gamma".to_string()]
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::from_toml_str("[retry]\nmax_attempts = 0").is_err());
        assert!(Config::from_toml_str("[breaker]\nfailure_threshold = 150.0").is_err());
        assert!(Config::from_toml_str("[timeout]\ntimeout_ms = 0").is_err());
        assert!(Config::from_toml_str("[unknown]\nx = 1").is_err());
        assert!(Config::from_toml_str("[retry.provider_switch]\nslowness = [\"beta\"]").is_err());
        assert!(
            Config::from_toml_str("[[classify.rules]]\ncategory = \"network\"\nretryable = true")
                .is_err()
        );
    }

    #[test]
    fn classify_rules_take_precedence() {
        let config = Config::from_toml_str(
            r#"
            [[classify.rules]]
            category = "rate_limit"
            retryable = true
            pattern = "quota"
        "#,
        )
        .unwrap();
        let classifier = config.classify.to_classifier().unwrap();
        let err = PalisadeError::provider("alpha", "monthly quota reached");
        let class = classifier.classify(&err);
        assert_eq!(class.category, ErrorCategory::RateLimit);
        assert!(class.retryable);
    }
}
