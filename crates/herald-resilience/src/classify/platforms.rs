//! Per-platform classification tables.
//!
//! A table is an ordered list of rules; the first rule whose matcher accepts
//! the error decides the classification. Tables are plain data and can be
//! loaded from JSON, so supporting a new platform never needs new code.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{FailureCategory, FailureClassification, ProviderError, RecoveryAction};

/// Fallback rate-limit window for tables that don't declare one.
const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;

fn default_rate_limit_window_ms() -> u64 {
    DEFAULT_RATE_LIMIT_WINDOW_MS
}

/// How a rule recognizes an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
    /// Error code equals this value (ASCII case-insensitive).
    Code(String),
    /// Error code starts with this value.
    CodePrefix(String),
    /// Error message contains this fragment (ASCII case-insensitive).
    MessageContains(String),
}

impl Matcher {
    pub fn matches(&self, error: &ProviderError) -> bool {
        let code = error.code.trim();
        match self {
            Matcher::Code(c) => code.eq_ignore_ascii_case(c),
            Matcher::CodePrefix(p) => code
                .to_ascii_lowercase()
                .starts_with(&p.to_ascii_lowercase()),
            Matcher::MessageContains(m) => error
                .message
                .to_ascii_lowercase()
                .contains(&m.to_ascii_lowercase()),
        }
    }
}

/// One entry in a platform table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "match")]
    pub matcher: Matcher,
    pub category: FailureCategory,
    /// Overrides the category's default retryability.
    #[serde(default)]
    pub retryable: Option<bool>,
    #[serde(default)]
    pub suggested_delay_ms: Option<u64>,
    #[serde(default)]
    pub requires_human_review: Option<bool>,
    #[serde(default)]
    pub action: Option<RecoveryAction>,
}

impl Rule {
    pub fn new(matcher: Matcher, category: FailureCategory) -> Self {
        Self {
            matcher,
            category,
            retryable: None,
            suggested_delay_ms: None,
            requires_human_review: None,
            action: None,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.suggested_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn human_review(mut self, required: bool) -> Self {
        self.requires_human_review = Some(required);
        self
    }
}

/// Ordered classification rules for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformTable {
    pub platform: String,
    /// Other identifiers this table answers to.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Delay used for rate-limit rules without an explicit delay.
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
    pub rules: Vec<Rule>,
}

impl PlatformTable {
    pub fn new(platform: impl Into<String>, rate_limit_window: Duration) -> Self {
        Self {
            platform: platform.into(),
            aliases: Vec::new(),
            rate_limit_window_ms: rate_limit_window.as_millis() as u64,
            rules: Vec::new(),
        }
    }

    /// Parse a table from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Parse a list of tables from JSON.
    pub fn list_from_json(json: &str) -> Result<Vec<Self>, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn alias(mut self, name: impl Into<String>) -> Self {
        self.aliases.push(name.into());
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Shorthand for an exact-code rule with category defaults.
    pub fn code(self, code: &str, category: FailureCategory) -> Self {
        self.rule(Rule::new(Matcher::Code(code.to_string()), category))
    }

    /// Shorthand for a rate-limit rule with an explicit window.
    pub fn rate_limit(self, code: &str, delay: Duration) -> Self {
        self.rule(Rule::new(Matcher::Code(code.to_string()), FailureCategory::RateLimited).delay(delay))
    }

    /// Shorthand for a message-fragment rule with category defaults.
    pub fn message(self, fragment: &str, category: FailureCategory) -> Self {
        self.rule(Rule::new(
            Matcher::MessageContains(fragment.to_string()),
            category,
        ))
    }

    /// Classification produced when `rule` matches.
    pub fn rule_classification(&self, rule: &Rule) -> FailureClassification {
        let mut classification = FailureClassification::for_category(rule.category);
        if let Some(retryable) = rule.retryable {
            classification.is_retryable = retryable;
        }
        if let Some(review) = rule.requires_human_review {
            classification.requires_human_review = review;
        }
        if rule.action.is_some() {
            classification.action = rule.action;
        }
        classification.suggested_delay = rule.suggested_delay_ms.map(Duration::from_millis);
        if rule.category == FailureCategory::RateLimited && classification.suggested_delay.is_none()
        {
            classification.suggested_delay = Some(Duration::from_millis(self.rate_limit_window_ms));
        }
        classification
    }

    /// Classify `error`, or `None` if no rule matches.
    pub fn classify(&self, error: &ProviderError) -> Option<FailureClassification> {
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(error))
            .map(|rule| self.rule_classification(rule))
    }
}

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// Tables for the platforms supported out of the box.
pub fn builtin_tables() -> Vec<PlatformTable> {
    use FailureCategory::*;

    let facebook = PlatformTable::new("facebook", HOUR)
        .code("1", Transient)
        .code("2", Transient)
        .code("4", RateLimited)
        .code("17", RateLimited)
        .code("32", RateLimited)
        .code("341", RateLimited)
        .code("613", RateLimited)
        .rule(Rule::new(Matcher::CodePrefix("8000".into()), RateLimited))
        .code("429", RateLimited)
        .code("10", AuthError)
        .code("102", AuthError)
        .code("190", AuthError)
        .code("200", AuthError)
        .code("368", ContentPolicy)
        .code("506", PermanentPlatformError)
        .code("100", PermanentPlatformError)
        .code("324", PermanentPlatformError)
        .code("1609005", PermanentPlatformError)
        .message("spam", ContentPolicy)
        .message("community standards", ContentPolicy);

    let instagram = PlatformTable::new("instagram", HOUR)
        .code("4", RateLimited)
        .code("17", RateLimited)
        .code("32", RateLimited)
        .code("613", RateLimited)
        .rate_limit("9", DAY)
        .code("429", RateLimited)
        .code("10", AuthError)
        .code("190", AuthError)
        .code("36003", PermanentPlatformError)
        .code("2207026", PermanentPlatformError)
        .code("9004", PermanentPlatformError)
        .code("100", PermanentPlatformError)
        .message("restricted", ContentPolicy);

    let youtube = PlatformTable::new("youtube", HOUR)
        .rate_limit("quotaExceeded", DAY)
        .rate_limit("uploadLimitExceeded", DAY)
        .rate_limit("rateLimitExceeded", MINUTE)
        .rate_limit("userRateLimitExceeded", MINUTE)
        .code("429", RateLimited)
        .code("authError", AuthError)
        .code("unauthorized", AuthError)
        .code("401", AuthError)
        .code("forbidden", AuthError)
        .code("403", AuthError)
        .code("backendError", Transient)
        .code("invalidTitle", PermanentPlatformError)
        .code("invalidDescription", PermanentPlatformError)
        .code("invalidTags", PermanentPlatformError)
        .code("processingFailed", PermanentPlatformError)
        .code("videoRejected", ContentPolicy)
        .message("community guidelines", ContentPolicy);

    let linkedin = PlatformTable::new("linkedin", DAY)
        .rate_limit("429", HOUR)
        .code("401", AuthError)
        .code("REVOKED_ACCESS_TOKEN", AuthError)
        .code("EXPIRED_ACCESS_TOKEN", AuthError)
        .code("403", AuthError)
        .code("ACCESS_DENIED", AuthError)
        .code("DUPLICATE_POST", PermanentPlatformError)
        .code("422", PermanentPlatformError)
        .code("400", PermanentPlatformError)
        .message("content is a duplicate", PermanentPlatformError);

    let twitter = PlatformTable::new("twitter", Duration::from_secs(900))
        .alias("x")
        .code("88", RateLimited)
        .code("429", RateLimited)
        .rate_limit("185", DAY)
        .code("32", AuthError)
        .code("89", AuthError)
        .code("401", AuthError)
        .code("130", Transient)
        .code("131", Transient)
        .code("186", PermanentPlatformError)
        .code("187", PermanentPlatformError)
        .code("64", ContentPolicy)
        .code("326", ContentPolicy);

    let tiktok = PlatformTable::new("tiktok", MINUTE)
        .code("rate_limit_exceeded", RateLimited)
        .rate_limit("spam_risk_too_many_posts", DAY)
        .code("429", RateLimited)
        .code("spam_risk_user_banned_from_posting", ContentPolicy)
        .code("access_token_invalid", AuthError)
        .code("scope_not_authorized", AuthError)
        .code("internal_error", Transient)
        .code("invalid_params", PermanentPlatformError);

    vec![facebook, instagram, youtube, linkedin, twitter, tiktok]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_matching_rule_wins() {
        let table = PlatformTable::new("test", MINUTE)
            .code("1", FailureCategory::Transient)
            .rule(Rule::new(
                Matcher::CodePrefix("1".into()),
                FailureCategory::PermanentPlatformError,
            ));

        let c = table.classify(&ProviderError::new("1", "")).unwrap();
        assert_eq!(c.category, FailureCategory::Transient);

        let c = table.classify(&ProviderError::new("12", "")).unwrap();
        assert_eq!(c.category, FailureCategory::PermanentPlatformError);
    }

    #[test]
    fn test_no_match_returns_none() {
        let table = PlatformTable::new("test", MINUTE).code("1", FailureCategory::Transient);
        assert!(table.classify(&ProviderError::new("2", "")).is_none());
    }

    #[test]
    fn test_rule_overrides() {
        let table = PlatformTable::new("test", MINUTE).rule(
            Rule::new(Matcher::Code("x".into()), FailureCategory::AuthError)
                .retryable(true)
                .human_review(true),
        );
        let c = table.classify(&ProviderError::new("X", "")).unwrap();
        assert!(c.is_retryable);
        assert!(c.requires_human_review);
        assert_eq!(c.action, Some(RecoveryAction::RefreshCredentials));
    }

    #[test]
    fn test_rate_limit_uses_table_window() {
        let table = PlatformTable::new("test", Duration::from_secs(42))
            .code("429", FailureCategory::RateLimited)
            .rate_limit("quota", HOUR);
        let c = table.classify(&ProviderError::new("429", "")).unwrap();
        assert_eq!(c.suggested_delay, Some(Duration::from_secs(42)));
        let c = table.classify(&ProviderError::new("quota", "")).unwrap();
        assert_eq!(c.suggested_delay, Some(HOUR));
    }

    #[test]
    fn test_message_matcher() {
        let m = Matcher::MessageContains("Spam".into());
        assert!(m.matches(&ProviderError::new("1", "flagged as SPAM by filters")));
        assert!(!m.matches(&ProviderError::new("1", "ok")));
    }

    #[test]
    fn test_facebook_business_use_case_limit() {
        let table = builtin_tables()
            .into_iter()
            .find(|t| t.platform == "facebook")
            .unwrap();
        let c = table.classify(&ProviderError::new("80004", "")).unwrap();
        assert_eq!(c.category, FailureCategory::RateLimited);
        assert_eq!(c.suggested_delay, Some(HOUR));
    }

    #[test]
    fn test_json_defaults() {
        let table = PlatformTable::from_json(
            r#"{"platform":"p","rules":[{"match":{"code_prefix":"5"},"category":"transient"}]}"#,
        )
        .unwrap();
        assert_eq!(table.rate_limit_window_ms, DEFAULT_RATE_LIMIT_WINDOW_MS);
        assert!(table.aliases.is_empty());
        assert_eq!(
            table.rules[0].matcher,
            Matcher::CodePrefix("5".to_string())
        );
    }

    #[test]
    fn test_builtin_tables_round_trip_through_json() {
        let tables = builtin_tables();
        let json = serde_json::to_string(&tables).unwrap();
        assert_eq!(PlatformTable::list_from_json(&json).unwrap(), tables);
    }
}
