//! Types for text generation calls passing through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A generation request as handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Prompt text.
    pub prompt: String,

    /// Supplementary context (prior conversation, data summaries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// Requested output language (BCP 47 tag, e.g. "en").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl GenerateRequest {
    /// Create a request with the given prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: None,
            language: None,
        }
    }

    /// Attach context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set the requested language.
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Options for text generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Model to use for generation.
    pub model: String,

    /// Maximum number of tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,

    /// Sampling temperature (0.0 to 2.0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Sequences where generation should stop.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

impl GenerateOptions {
    /// Create options with the specified model.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop_sequences: Vec::new(),
        }
    }

    /// Set max tokens.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set temperature.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set top_p.
    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Add a single stop sequence.
    pub fn stop_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.stop_sequences.push(sequence.into());
        self
    }
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Disclosure of how a result was obtained.
///
/// Attached to every response leaving the fallback layer so callers can
/// tell a fresh answer from a degraded one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackMetadata {
    /// Served from the response cache instead of a live provider.
    pub used_cache: bool,
    /// Number of provider switches before success.
    pub provider_switches: u32,
    /// Provider that originally served a cached value, or the fallback provider used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub served_by: Option<String>,
}

impl FallbackMetadata {
    /// Whether the response is anything other than a fresh primary answer.
    pub fn is_degraded(&self) -> bool {
        self.used_cache || self.provider_switches > 0
    }
}

/// Response from text generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// Generated text.
    pub text: String,

    /// Provider that produced the text.
    pub provider: String,

    /// Model used for generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// When the provider produced this response. Cache-age checks use it.
    pub timestamp: DateTime<Utc>,

    /// Human-readable notes for the caller (e.g. degradation disclosure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Fallback disclosure, set by the fallback layer.
    #[serde(default)]
    pub fallback: FallbackMetadata,
}

impl GenerateResponse {
    /// Create a response stamped with the current time.
    pub fn new(provider: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            provider: provider.into(),
            model: None,
            timestamp: Utc::now(),
            message: None,
            fallback: FallbackMetadata::default(),
        }
    }

    /// Set the model.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Append a line to the message field.
    pub fn append_message(&mut self, note: &str) {
        match &mut self.message {
            Some(existing) if !existing.is_empty() => {
                existing.push('\n');
                existing.push_str(note);
            }
            _ => self.message = Some(note.to_string()),
        }
    }

    /// Age of this response relative to `now`. Negative ages clamp to zero.
    pub fn age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.timestamp).to_std().unwrap_or_default()
    }
}
