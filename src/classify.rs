//! Error classification.
//!
//! Provider failures arrive as free-form vendor messages. The
//! [`ErrorClassifier`] maps them onto an [`ErrorCategory`] by walking an
//! ordered table of [`ClassificationRule`]s; the first rule that matches
//! wins. Permanent categories (auth, validation, not-found, other 4xx) sit
//! ahead of transient ones so that, e.g., a 401 mentioning "timeout" in its
//! body is never retried.
//!
//! New vendor vocabularies are added as rules:
//!
//! ```rust
//! # use palisade::classify::{ClassificationRule, ErrorCategory, ErrorClassifier};
//! let classifier = ErrorClassifier::default().prepend_rule(
//!     ClassificationRule::pattern(ErrorCategory::Unavailable, true, r"engine is warming up")
//!         .unwrap(),
//! );
//! # let _ = classifier;
//! ```

use std::fmt;
use std::ops::RangeInclusive;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{PalisadeError, Result};

/// Failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Authentication,
    NotFound,
    ClientError,
    RateLimit,
    Timeout,
    Network,
    ServerError,
    Unavailable,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Network => "network",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::Unavailable => "unavailable",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = PalisadeError;

    fn from_str(s: &str) -> Result<Self> {
        const ALL: [ErrorCategory; 10] = [
            ErrorCategory::Validation,
            ErrorCategory::Authentication,
            ErrorCategory::NotFound,
            ErrorCategory::ClientError,
            ErrorCategory::RateLimit,
            ErrorCategory::Timeout,
            ErrorCategory::Network,
            ErrorCategory::ServerError,
            ErrorCategory::Unavailable,
            ErrorCategory::Unknown,
        ];
        ALL.into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PalisadeError::Configuration(format!("unknown error category {s:?}")))
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
}

/// One row of the classification table.
///
/// Matches when the (lowercased) message matches `pattern` or the status
/// code falls in `status`.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub category: ErrorCategory,
    pub retryable: bool,
    pattern: Option<Regex>,
    status: Option<RangeInclusive<u16>>,
}

impl ClassificationRule {
    /// Rule matching messages against `pattern` (case-insensitive).
    pub fn pattern(category: ErrorCategory, retryable: bool, pattern: &str) -> Result<Self> {
        let regex = Regex::new(&format!("(?i){pattern}")).map_err(|e| {
            PalisadeError::Configuration(format!("invalid classification pattern {pattern:?}: {e}"))
        })?;
        Ok(Self {
            category,
            retryable,
            pattern: Some(regex),
            status: None,
        })
    }

    /// Rule matching a status-code range only.
    pub fn status(category: ErrorCategory, retryable: bool, range: RangeInclusive<u16>) -> Self {
        Self {
            category,
            retryable,
            pattern: None,
            status: Some(range),
        }
    }

    /// Also match status codes in `range`.
    pub fn or_status(mut self, range: RangeInclusive<u16>) -> Self {
        self.status = Some(range);
        self
    }

    fn matches(&self, message: &str, status: Option<u16>) -> bool {
        let by_status = matches!((&self.status, status), (Some(range), Some(code)) if range.contains(&code));
        let by_pattern = self.pattern.as_ref().is_some_and(|re| re.is_match(message));
        by_status || by_pattern
    }
}

/// Ordered, data-driven error classifier.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

impl ErrorClassifier {
    /// Classifier with no rules: every provider error is `Unknown`.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a rule with the highest precedence.
    pub fn prepend_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    /// Add a rule with the lowest precedence.
    pub fn push_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Classify `error`.
    ///
    /// Wrapper errors are classified by their innermost cause. Typed
    /// pipeline errors map directly; provider errors go through the table.
    /// Anything unmatched is `Unknown` and not retryable.
    pub fn classify(&self, error: &PalisadeError) -> Classification {
        let error = innermost(error);
        match error {
            PalisadeError::Validation(_) | PalisadeError::Sanitize { .. } => {
                return Classification {
                    category: ErrorCategory::Validation,
                    retryable: false,
                };
            }
            PalisadeError::Timeout { .. } => {
                return Classification {
                    category: ErrorCategory::Timeout,
                    retryable: true,
                };
            }
            PalisadeError::CircuitBreaker { source: None, .. } | PalisadeError::NoProvider => {
                return Classification {
                    category: ErrorCategory::Unavailable,
                    retryable: true,
                };
            }
            PalisadeError::Configuration(_) | PalisadeError::Json(_) => {
                return Classification {
                    category: ErrorCategory::Unknown,
                    retryable: false,
                };
            }
            _ => {}
        }

        let message = match error {
            PalisadeError::Provider { message, .. } => message.to_lowercase(),
            other => other.to_string().to_lowercase(),
        };
        let status = error.status();
        self.rules
            .iter()
            .find(|rule| rule.matches(&message, status))
            .map(|rule| Classification {
                category: rule.category,
                retryable: rule.retryable,
            })
            .unwrap_or(Classification {
                category: ErrorCategory::Unknown,
                retryable: false,
            })
    }

    /// Shorthand for `classify(error).retryable`.
    pub fn is_retryable(&self, error: &PalisadeError) -> bool {
        self.classify(error).retryable
    }
}

/// Follow wrapper errors down to the original cause.
fn innermost(error: &PalisadeError) -> &PalisadeError {
    match error {
        PalisadeError::Retry { source, .. } | PalisadeError::Fallback { source, .. } => {
            innermost(source)
        }
        PalisadeError::CircuitBreaker {
            source: Some(source),
            ..
        } => innermost(source),
        other => other,
    }
}

type RuleRow = (ErrorCategory, bool, Option<&'static str>, Option<(u16, u16)>);

/// Built-in table, highest precedence first.
const DEFAULT_RULES: &[RuleRow] = &[
    (
        ErrorCategory::Authentication,
        false,
        Some(r"unauthori[sz]ed|authentication|forbidden|invalid api key|permission denied"),
        Some((401, 403)),
    ),
    (
        ErrorCategory::Validation,
        false,
        Some(r"validation|invalid (request|input|argument|parameter)|malformed|bad request"),
        Some((400, 400)),
    ),
    (
        ErrorCategory::NotFound,
        false,
        Some(r"not found|no such model|does not exist"),
        Some((404, 404)),
    ),
    (
        ErrorCategory::RateLimit,
        true,
        Some(r"rate.?limit|too many requests|quota exceeded"),
        Some((429, 429)),
    ),
    (
        ErrorCategory::Timeout,
        true,
        Some(r"timed? ?out|deadline exceeded"),
        Some((408, 408)),
    ),
    (ErrorCategory::ClientError, false, None, Some((400, 499))),
    (
        ErrorCategory::Network,
        true,
        Some(r"connection (refused|reset|closed|aborted)|network|socket|dns|broken pipe|econn"),
        None,
    ),
    (
        ErrorCategory::ServerError,
        true,
        Some(r"internal server error|bad gateway|gateway timeout"),
        Some((500, 599)),
    ),
    (
        ErrorCategory::Unavailable,
        true,
        Some(r"unavailable|overloaded|temporarily|try again"),
        None,
    ),
];

fn default_rules() -> Vec<ClassificationRule> {
    DEFAULT_RULES
        .iter()
        .filter_map(|&(category, retryable, pattern, status)| {
            let rule = match pattern {
                Some(pattern) => match ClassificationRule::pattern(category, retryable, pattern) {
                    Ok(rule) => rule,
                    Err(e) => {
                        warn!(%category, error = %e, "skipping invalid built-in rule");
                        return None;
                    }
                },
                None => ClassificationRule {
                    category,
                    retryable,
                    pattern: None,
                    status: None,
                },
            };
            Some(match status {
                Some((lo, hi)) => rule.or_status(lo..=hi),
                None => rule,
            })
        })
        .collect()
}
