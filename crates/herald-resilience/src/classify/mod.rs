//! Failure classification.
//!
//! Maps a raw provider error onto a [`FailureClassification`] that the retry
//! executor acts on. Classification happens in two layers:
//!
//! 1. A platform-agnostic table of transient network conditions
//!    (timeouts, connection resets, 5xx gateway errors).
//! 2. A per-platform [`PlatformTable`] of ordered rules, looked up by
//!    platform identifier in the [`FailureClassifier`] registry.
//!
//! Anything neither layer recognizes is `Unknown`: not retryable and flagged
//! for human review.

mod generic;
mod platforms;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use generic::is_transient;
pub use platforms::{Matcher, PlatformTable, Rule, builtin_tables};

/// Broad failure categories that drive retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Network hiccup or timeout. Retry with normal backoff.
    Transient,
    /// Provider quota hit. Retry after the suggested delay.
    RateLimited,
    /// Credentials rejected. Needs an out-of-band refresh first.
    AuthError,
    /// Content rejected by the platform. Needs a human.
    ContentPolicy,
    /// The request can never succeed as-is.
    PermanentPlatformError,
    /// Unrecognized error.
    Unknown,
}

impl FailureCategory {
    /// Whether failures in this category are retried unless a rule says otherwise.
    pub fn default_retryable(self) -> bool {
        matches!(self, FailureCategory::Transient | FailureCategory::RateLimited)
    }

    /// Whether failures in this category say something about downstream health.
    ///
    /// Only these count toward opening a circuit breaker.
    pub fn indicates_unhealthy_downstream(self) -> bool {
        matches!(self, FailureCategory::Transient | FailureCategory::RateLimited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::Transient => "transient",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::AuthError => "auth_error",
            FailureCategory::ContentPolicy => "content_policy",
            FailureCategory::PermanentPlatformError => "permanent_platform_error",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hint for what the caller should do before the work can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Refresh or re-authorize the credential, then retry.
    RefreshCredentials,
    /// Have someone review or edit the content.
    ReviewContent,
    /// Wait for the provider quota window to reset.
    WaitForQuota,
    /// Nobody knows what happened; escalate.
    Escalate,
}

/// The outcome of analyzing one failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureClassification {
    pub category: FailureCategory,
    pub is_retryable: bool,
    /// Minimum wait before the next attempt, independent of backoff.
    #[serde(default, with = "millis")]
    pub suggested_delay: Option<Duration>,
    pub requires_human_review: bool,
    #[serde(default)]
    pub action: Option<RecoveryAction>,
}

impl FailureClassification {
    /// Default classification for a category.
    pub fn for_category(category: FailureCategory) -> Self {
        let (requires_human_review, action) = match category {
            FailureCategory::Transient | FailureCategory::PermanentPlatformError => (false, None),
            FailureCategory::RateLimited => (false, Some(RecoveryAction::WaitForQuota)),
            FailureCategory::AuthError => (false, Some(RecoveryAction::RefreshCredentials)),
            FailureCategory::ContentPolicy => (true, Some(RecoveryAction::ReviewContent)),
            FailureCategory::Unknown => (true, Some(RecoveryAction::Escalate)),
        };
        Self {
            category,
            is_retryable: category.default_retryable(),
            suggested_delay: None,
            requires_human_review,
            action,
        }
    }

    pub fn transient() -> Self {
        Self::for_category(FailureCategory::Transient)
    }

    /// Rate limited failures always carry a delay.
    pub fn rate_limited(delay: Duration) -> Self {
        Self {
            suggested_delay: Some(delay),
            ..Self::for_category(FailureCategory::RateLimited)
        }
    }

    pub fn auth_error() -> Self {
        Self::for_category(FailureCategory::AuthError)
    }

    pub fn content_policy() -> Self {
        Self::for_category(FailureCategory::ContentPolicy)
    }

    pub fn permanent() -> Self {
        Self::for_category(FailureCategory::PermanentPlatformError)
    }

    pub fn unknown() -> Self {
        Self::for_category(FailureCategory::Unknown)
    }
}

/// A failure reported by an external platform, as raw data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    /// Platform identifier (e.g. `facebook`), if known.
    #[serde(default)]
    pub platform: Option<String>,
    /// Provider error code, HTTP status, or network error code.
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            platform: None,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn for_platform(
        platform: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            platform: Some(platform.into()),
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.platform {
            Some(platform) => write!(f, "{} error {}: {}", platform, self.code, self.message),
            None => write!(f, "error {}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Something that can classify errors of type `E`.
pub trait Classify<E>: Send + Sync {
    fn classify(&self, error: &E) -> FailureClassification;
}

impl<E, F> Classify<E> for F
where
    F: Fn(&E) -> FailureClassification + Send + Sync,
{
    fn classify(&self, error: &E) -> FailureClassification {
        self(error)
    }
}

/// Adapts a plain `is_retryable` predicate into a classifier.
///
/// Retryable errors are `Transient`; everything else is permanent.
pub struct RetryablePredicate<F>(pub F);

impl<E, F> Classify<E> for RetryablePredicate<F>
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn classify(&self, error: &E) -> FailureClassification {
        if (self.0)(error) {
            FailureClassification::transient()
        } else {
            FailureClassification::permanent()
        }
    }
}

/// Registry of per-platform rule tables.
pub struct FailureClassifier {
    tables: DashMap<String, Arc<PlatformTable>>,
}

impl FailureClassifier {
    /// An empty registry. Only the generic transient layer applies.
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }

    /// A registry preloaded with the built-in platform tables.
    pub fn with_builtin_tables() -> Self {
        let classifier = Self::new();
        for table in builtin_tables() {
            classifier.register(table);
        }
        classifier
    }

    /// Register (or replace) a platform table under its name and aliases.
    pub fn register(&self, table: PlatformTable) {
        let table = Arc::new(table);
        for name in std::iter::once(&table.platform).chain(table.aliases.iter()) {
            self.tables.insert(normalize(name), Arc::clone(&table));
        }
        debug!(platform = %table.platform, rules = table.rules.len(), "registered platform table");
    }

    /// Registered platform identifiers, including aliases.
    pub fn platforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Classify an error reported by `platform`.
    pub fn classify(&self, platform: &str, error: &ProviderError) -> FailureClassification {
        if is_transient(error) {
            return FailureClassification::transient();
        }

        let table = self.tables.get(&normalize(platform)).map(|t| Arc::clone(t.value()));
        let classification = table
            .as_ref()
            .and_then(|t| t.classify(error))
            .unwrap_or_else(FailureClassification::unknown);

        debug!(
            platform,
            code = %error.code,
            category = %classification.category,
            retryable = classification.is_retryable,
            "classified provider error"
        );
        classification
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::with_builtin_tables()
    }
}

impl Classify<ProviderError> for FailureClassifier {
    fn classify(&self, error: &ProviderError) -> FailureClassification {
        let platform = error.platform.as_deref().unwrap_or_default();
        FailureClassifier::classify(self, platform, error)
    }
}

fn normalize(platform: &str) -> String {
    platform.trim().to_ascii_lowercase()
}

/// Serde helper storing `Option<Duration>` as milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_generic_transient_wins_over_platform_table() {
        let classifier = FailureClassifier::with_builtin_tables();
        let error = ProviderError::new("503", "Service Unavailable");
        assert_eq!(
            classifier.classify("facebook", &error),
            FailureClassification::transient()
        );
        // Even for platforms without a table
        assert_eq!(
            classifier.classify("mastodon", &error),
            FailureClassification::transient()
        );
    }

    #[test]
    fn test_unmapped_code_is_unknown_and_flagged() {
        let classifier = FailureClassifier::with_builtin_tables();
        let c = classifier.classify("facebook", &ProviderError::new("999999", "weird"));
        assert_eq!(c.category, FailureCategory::Unknown);
        assert!(!c.is_retryable);
        assert!(c.requires_human_review);
        assert_eq!(c.action, Some(RecoveryAction::Escalate));
    }

    #[test]
    fn test_unregistered_platform_is_unknown() {
        let classifier = FailureClassifier::new();
        let c = classifier.classify("myspace", &ProviderError::new("190", "token"));
        assert_eq!(c, FailureClassification::unknown());
    }

    #[test]
    fn test_rate_limited_always_has_delay() {
        let classifier = FailureClassifier::with_builtin_tables();
        for table in builtin_tables() {
            for rule in &table.rules {
                let c = table.rule_classification(rule);
                if c.category == FailureCategory::RateLimited {
                    assert!(
                        c.suggested_delay.is_some(),
                        "{} rule {:?} has no delay",
                        table.platform,
                        rule.matcher
                    );
                }
            }
        }
        let c = classifier.classify("twitter", &ProviderError::new("88", "Rate limit exceeded"));
        assert_eq!(c.category, FailureCategory::RateLimited);
        assert_eq!(c.suggested_delay, Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_auth_error_hints_refresh() {
        let classifier = FailureClassifier::with_builtin_tables();
        let c = classifier.classify(
            "facebook",
            &ProviderError::new("190", "Error validating access token"),
        );
        assert_eq!(c.category, FailureCategory::AuthError);
        assert!(!c.is_retryable);
        assert_eq!(c.action, Some(RecoveryAction::RefreshCredentials));
    }

    #[test]
    fn test_platform_lookup_is_case_insensitive() {
        let classifier = FailureClassifier::with_builtin_tables();
        let c = classifier.classify("YouTube", &ProviderError::new("quotaExceeded", ""));
        assert_eq!(c.category, FailureCategory::RateLimited);
    }

    #[test]
    fn test_alias_lookup() {
        let classifier = FailureClassifier::with_builtin_tables();
        let c = classifier.classify("x", &ProviderError::new("187", "Status is a duplicate"));
        assert_eq!(c.category, FailureCategory::PermanentPlatformError);
    }

    #[test]
    fn test_registering_new_platform_is_data_only() {
        let classifier = FailureClassifier::new();
        let json = r#"{
            "platform": "mastodon",
            "rate_limit_window_ms": 300000,
            "rules": [
                { "match": { "code": "429" }, "category": "rate_limited" },
                { "match": { "message_contains": "validation failed" }, "category": "content_policy" }
            ]
        }"#;
        classifier.register(PlatformTable::from_json(json).unwrap());

        let c = classifier.classify("mastodon", &ProviderError::new("429", "Too many requests"));
        assert_eq!(c, FailureClassification::rate_limited(Duration::from_secs(300)));

        let c = classifier.classify(
            "mastodon",
            &ProviderError::new("422", "Validation failed: Text too long"),
        );
        assert_eq!(c.category, FailureCategory::ContentPolicy);
        assert!(c.requires_human_review);
    }

    #[test]
    fn test_classify_trait_uses_error_platform() {
        let classifier = FailureClassifier::with_builtin_tables();
        let error = ProviderError::for_platform("linkedin", "DUPLICATE_POST", "duplicate");
        let c = Classify::classify(&classifier, &error);
        assert_eq!(c.category, FailureCategory::PermanentPlatformError);
    }

    #[test]
    fn test_retryable_predicate() {
        let classify = RetryablePredicate(|e: &String| e.contains("again"));
        assert_eq!(
            classify.classify(&"try again".to_string()).category,
            FailureCategory::Transient
        );
        assert!(!classify.classify(&"nope".to_string()).is_retryable);
    }

    #[test]
    fn test_classification_serializes_delay_as_millis() {
        let json =
            serde_json::to_value(FailureClassification::rate_limited(Duration::from_secs(5)))
                .unwrap();
        assert_eq!(json["category"], "rate_limited");
        assert_eq!(json["suggested_delay"], 5000);
    }
}
