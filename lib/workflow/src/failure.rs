//! Failure classification, retry and fallback handling for node execution.
//!
//! Node errors are classified by matching their text against ordered keyword
//! groups; the first group that matches decides the category, and the
//! category decides whether a retry is worthwhile. Breaker rejections and
//! registry misses skip keyword matching since their meaning is already
//! known.

use crate::node::NodeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Classification of a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    CredentialMissing,
    CredentialInvalid,
    RateLimited,
    NetworkError,
    Timeout,
    ValidationError,
    ResourceNotFound,
    PermissionDenied,
    ConfigurationError,
    ExternalServiceError,
    Unknown,
}

/// Keyword groups in match order. Keywords are lowercase.
///
/// Credential groups only match qualified phrases, so a bare "not found"
/// falls through to [`ErrorCategory::ResourceNotFound`].
const KEYWORDS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::CredentialMissing,
        &[
            "missing credential",
            "no credential",
            "credential not found",
            "credential is required",
        ],
    ),
    (
        ErrorCategory::CredentialInvalid,
        &[
            "invalid credential",
            "credential expired",
            "unauthorized",
            "authentication failed",
            "invalid_grant",
            "token expired",
            "access denied",
            "invalid_auth",
            "invalid_token",
        ],
    ),
    (
        ErrorCategory::RateLimited,
        &["rate limit", "too many requests", "429", "quota exceeded"],
    ),
    (
        ErrorCategory::NetworkError,
        &[
            "connection refused",
            "connection reset",
            "network unreachable",
            "dns",
            "ssl",
            "certificate",
        ],
    ),
    (
        ErrorCategory::Timeout,
        &["timeout", "timed out", "deadline exceeded"],
    ),
    (
        ErrorCategory::ValidationError,
        &["validation", "invalid input", "required field", "type error"],
    ),
    (
        ErrorCategory::ResourceNotFound,
        &[
            "not found",
            "404",
            "does not exist",
            "no such",
            "channel_not_found",
        ],
    ),
    (
        ErrorCategory::PermissionDenied,
        &[
            "permission denied",
            "forbidden",
            "403",
            "not allowed",
            "not_in_channel",
            "missing_scope",
            "invite it",
        ],
    ),
    (
        ErrorCategory::ConfigurationError,
        &[
            "configuration",
            "config error",
            "missing config",
            "invalid config",
            "channel id is required",
        ],
    ),
    (
        ErrorCategory::ExternalServiceError,
        &[
            "500",
            "502",
            "503",
            "504",
            "internal server error",
            "service unavailable",
            "external service",
            "slack api error",
            "openrouter",
            "openai error",
            "google api error",
            "no endpoints found",
            "js execution error",
            "syntax error",
            "error executing code node",
        ],
    ),
];

/// Messages that already read well and are shown unchanged.
const DESCRIPTIVE_MARKERS: &[&str] = &["slack api error", "ai model error", "validation failed"];

impl ErrorCategory {
    /// Returns the snake_case name used on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CredentialMissing => "credential_missing",
            Self::CredentialInvalid => "credential_invalid",
            Self::RateLimited => "rate_limited",
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::ValidationError => "validation_error",
            Self::ResourceNotFound => "resource_not_found",
            Self::PermissionDenied => "permission_denied",
            Self::ConfigurationError => "configuration_error",
            Self::ExternalServiceError => "external_service_error",
            Self::Unknown => "unknown",
        }
    }

    /// Transient categories worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::NetworkError | Self::Timeout | Self::ExternalServiceError
        )
    }

    /// Actionable guidance shown next to the error.
    #[must_use]
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::CredentialMissing => "Configure the required credential in the node settings.",
            Self::CredentialInvalid => "Re-authenticate or update your credential.",
            Self::RateLimited => "Wait a moment and try again, or reduce request frequency.",
            Self::NetworkError => "Check your network connection and try again.",
            Self::Timeout => {
                "The operation took too long. Try with smaller data or increase timeout."
            }
            Self::ValidationError => "Check your input data matches the expected format.",
            Self::ResourceNotFound => "Verify the resource ID or URL is correct.",
            Self::PermissionDenied => {
                "Check your account has permission to access this resource, or ensure the bot/app has been invited and granted the necessary scopes."
            }
            Self::ConfigurationError => "Review and fix the node configuration.",
            Self::ExternalServiceError => {
                "The external service is having issues. Try again later."
            }
            Self::Unknown => "An unexpected error occurred. Check the logs for details.",
        }
    }

    /// Short headline for the category.
    #[must_use]
    pub fn headline(&self) -> &'static str {
        match self {
            Self::CredentialMissing => "Credential not configured",
            Self::CredentialInvalid => "Credential is invalid or expired",
            Self::RateLimited => "Rate limit exceeded",
            Self::NetworkError => "Network connection failed",
            Self::Timeout => "Operation timed out",
            Self::ValidationError => "Input validation failed",
            Self::ResourceNotFound => "Resource not found",
            Self::PermissionDenied => "Access Denied / Insufficient Permissions",
            Self::ConfigurationError => "Invalid configuration",
            Self::ExternalServiceError => "External service error",
            Self::Unknown => "Unexpected error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub category: ErrorCategory,
    /// Friendly message for display.
    pub message: String,
    /// The raw error text.
    pub original_error: String,
    pub is_retryable: bool,
    pub suggestion: String,
}

impl ErrorContext {
    fn new(category: ErrorCategory, original: &str, is_retryable: bool) -> Self {
        let lowered = original.to_lowercase();
        let message = if DESCRIPTIVE_MARKERS.iter().any(|m| lowered.contains(m)) {
            original.to_string()
        } else {
            category.headline().to_string()
        };

        Self {
            category,
            message,
            original_error: original.to_string(),
            is_retryable,
            suggestion: category.suggestion().to_string(),
        }
    }

    /// Builds the structured blob stored on a failed node run.
    #[must_use]
    pub fn to_report(&self) -> FailureReport {
        FailureReport {
            message: self.message.clone(),
            category: self.category,
            suggestion: self.suggestion.clone(),
            details: json!({
                "original_error": self.original_error,
                "is_retryable": self.is_retryable,
            }),
        }
    }
}

/// User-facing failure blob persisted on a node run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub message: String,
    pub category: ErrorCategory,
    pub suggestion: String,
    #[serde(default)]
    pub details: JsonValue,
}

impl FailureReport {
    /// Creates a report with the category's suggestion and no details.
    #[must_use]
    pub fn new(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            message: message.into(),
            category,
            suggestion: category.suggestion().to_string(),
            details: JsonValue::Null,
        }
    }
}

/// Maps errors onto categories.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classifies a node error.
    #[must_use]
    pub fn classify(error: &NodeError) -> ErrorContext {
        match error {
            // Known conditions; keyword matching would misread them.
            NodeError::BreakerOpen { .. } => ErrorContext::new(
                ErrorCategory::ExternalServiceError,
                &error.to_string(),
                false,
            ),
            NodeError::UnknownNodeType { .. } => ErrorContext::new(
                ErrorCategory::ConfigurationError,
                &error.to_string(),
                false,
            ),
            NodeError::Timeout { .. } => {
                ErrorContext::new(ErrorCategory::Timeout, &error.to_string(), true)
            }
            _ => Self::classify_message(&error.to_string()),
        }
    }

    /// Classifies raw error text.
    #[must_use]
    pub fn classify_message(text: &str) -> ErrorContext {
        let lowered = text.to_lowercase();
        let category = KEYWORDS
            .iter()
            .find(|(_, words)| words.iter().any(|w| lowered.contains(w)))
            .map_or(ErrorCategory::Unknown, |(category, _)| *category);

        ErrorContext::new(category, text, category.is_retryable())
    }
}

/// Output substituted for a failed node under the continue policy.
#[must_use]
pub fn fallback_output(context: &ErrorContext) -> JsonValue {
    json!({
        "_error": true,
        "_error_category": context.category.as_str(),
        "_error_message": context.message,
        "_error_suggestion": context.suggestion,
        "data": null,
        "status": "error",
    })
}

/// Bounded exponential backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 means a single attempt).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Sets the retry count.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before retry number `attempt + 1`: `min(base * 2^attempt, max)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Total attempts allowed.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Details of an upcoming retry, reported before the backoff sleep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryNotice {
    /// The attempt that just failed, starting at 1.
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: ErrorContext,
}

/// Receives retry notices, e.g. to publish `node_retrying` events.
#[async_trait]
pub trait RetryObserver: Send + Sync {
    async fn on_retry(&self, notice: RetryNotice);
}

/// Observer that ignores notices.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreRetries;

#[async_trait]
impl RetryObserver for IgnoreRetries {
    async fn on_retry(&self, _notice: RetryNotice) {}
}

/// Successful result of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

/// Final failure of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    /// The last error raised.
    pub error: NodeError,
    pub context: ErrorContext,
    pub attempts: u32,
}

impl fmt::Display for RetryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) after {} attempt(s)",
            self.error, self.context.category, self.attempts
        )
    }
}

impl std::error::Error for RetryFailure {}

/// Drives an operation under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails permanently, or runs out of
    /// attempts.
    ///
    /// `operation` receives the 1-based attempt number. Non-retryable errors
    /// are returned after the attempt that raised them.
    ///
    /// # Errors
    ///
    /// Returns the last error, classified, with the number of attempts made.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        mut operation: F,
        observer: &dyn RetryObserver,
    ) -> Result<RetryOutcome<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, NodeError>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match operation(attempt).await {
                Ok(value) => {
                    return Ok(RetryOutcome {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            let context = ErrorClassifier::classify(&error);
            if !context.is_retryable {
                tracing::debug!(
                    error = %error,
                    category = %context.category,
                    "non-retryable error, failing immediately"
                );
                return Err(RetryFailure {
                    error,
                    context,
                    attempts: attempt,
                });
            }

            if attempt >= max_attempts {
                tracing::warn!(
                    error = %error,
                    attempts = attempt,
                    "all retry attempts failed"
                );
                return Err(RetryFailure {
                    error,
                    context,
                    attempts: attempt,
                });
            }

            let delay = self.policy.delay_for(attempt - 1);
            tracing::debug!(
                attempt,
                max_attempts,
                backoff_ms = millis(delay),
                error = %error,
                "retrying after backoff"
            );
            observer
                .on_retry(RetryNotice {
                    attempt,
                    max_attempts,
                    delay,
                    error: context,
                })
                .await;
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn external(message: &str) -> NodeError {
        NodeError::ExternalService {
            service: "api".to_string(),
            message: message.to_string(),
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        notices: Mutex<Vec<RetryNotice>>,
    }

    #[async_trait]
    impl RetryObserver for RecordingObserver {
        async fn on_retry(&self, notice: RetryNotice) {
            self.notices.lock().unwrap().push(notice);
        }
    }

    #[test]
    fn classifies_by_first_matching_group() {
        let cases = [
            ("Missing credential for Slack", ErrorCategory::CredentialMissing),
            ("401 Unauthorized", ErrorCategory::CredentialInvalid),
            ("HTTP 429 Too Many Requests", ErrorCategory::RateLimited),
            ("Connection refused by peer", ErrorCategory::NetworkError),
            ("request timed out", ErrorCategory::Timeout),
            ("invalid input: expected list", ErrorCategory::ValidationError),
            ("sheet does not exist", ErrorCategory::ResourceNotFound),
            ("403 Forbidden", ErrorCategory::PermissionDenied),
            ("channel id is required", ErrorCategory::ConfigurationError),
            ("upstream returned 503", ErrorCategory::ExternalServiceError),
            ("something odd happened", ErrorCategory::Unknown),
        ];

        for (text, expected) in cases {
            assert_eq!(
                ErrorClassifier::classify_message(text).category,
                expected,
                "{text}"
            );
        }
    }

    #[test]
    fn credential_groups_need_a_qualifier() {
        let cases = [
            ("Slack credential expired", ErrorCategory::CredentialInvalid),
            ("channel not found", ErrorCategory::ResourceNotFound),
            ("model not found", ErrorCategory::ResourceNotFound),
            ("credential not found for sheets", ErrorCategory::CredentialMissing),
        ];

        for (text, expected) in cases {
            assert_eq!(
                ErrorClassifier::classify_message(text).category,
                expected,
                "{text}"
            );
        }
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn earlier_group_wins_on_overlap() {
        // "rate limit" is checked before the 5xx markers.
        let ctx = ErrorClassifier::classify_message("503: rate limit reached");
        assert_eq!(ctx.category, ErrorCategory::RateLimited);
    }

    #[test]
    fn only_transient_categories_retry() {
        assert!(ErrorClassifier::classify_message("dns lookup failed").is_retryable);
        assert!(!ErrorClassifier::classify_message("permission denied").is_retryable);
        assert!(!ErrorClassifier::classify_message("??").is_retryable);
    }

    #[test]
    fn descriptive_messages_are_kept() {
        let ctx = ErrorClassifier::classify_message("Slack API error: not_in_channel");
        assert_eq!(ctx.category, ErrorCategory::PermissionDenied);
        assert_eq!(ctx.message, "Slack API error: not_in_channel");

        let ctx = ErrorClassifier::classify_message("HTTP 404");
        assert_eq!(ctx.message, "Resource not found");
        assert_eq!(ctx.original_error, "HTTP 404");
    }

    #[test]
    fn breaker_rejection_is_never_retried() {
        let ctx = ErrorClassifier::classify(&NodeError::BreakerOpen {
            name: "openai".to_string(),
        });
        assert_eq!(ctx.category, ErrorCategory::ExternalServiceError);
        assert!(!ctx.is_retryable);
    }

    #[test]
    fn unknown_node_type_is_configuration() {
        let ctx = ErrorClassifier::classify(&NodeError::UnknownNodeType {
            node_type: "nope".to_string(),
        });
        assert_eq!(ctx.category, ErrorCategory::ConfigurationError);
        assert!(!ctx.is_retryable);
    }

    #[test]
    fn fallback_output_shape() {
        let ctx = ErrorClassifier::classify(&external("502 bad gateway"));
        let output = fallback_output(&ctx);
        assert_eq!(output["_error"], true);
        assert_eq!(output["_error_category"], "external_service_error");
        assert_eq!(output["_error_message"], "External service error");
        assert_eq!(output["data"], JsonValue::Null);
        assert_eq!(output["status"], "error");
    }

    #[test]
    fn report_carries_details() {
        let report = ErrorClassifier::classify_message("quota exceeded").to_report();
        assert_eq!(report.category, ErrorCategory::RateLimited);
        assert_eq!(report.details["original_error"], "quota exceeded");
        assert_eq!(report.details["is_retryable"], true);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(64), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures_with_k_retries() {
        let k = 3;
        let calls = Arc::new(Mutex::new(0));
        let observer = RecordingObserver::default();
        let handler = RetryHandler::new(RetryPolicy::default().with_max_retries(k));

        let outcome = handler
            .execute_with_retry(
                |_| {
                    let calls = calls.clone();
                    async move {
                        let mut n = calls.lock().unwrap();
                        *n += 1;
                        if *n <= k {
                            Err(external("503 service unavailable"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                &observer,
            )
            .await
            .expect("should succeed");

        assert_eq!(outcome.value, "done");
        assert_eq!(outcome.attempts, k + 1);

        let notices = observer.notices.lock().unwrap();
        let delays: Vec<_> = notices.iter().map(|n| n.delay.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4]);
        assert_eq!(notices[0].max_attempts, k + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_retries_run_out() {
        let handler = RetryHandler::new(RetryPolicy::default().with_max_retries(1));
        let failure = handler
            .execute_with_retry(
                |attempt| async move {
                    Err::<(), _>(external(&format!("504 gateway timeout #{attempt}")))
                },
                &IgnoreRetries,
            )
            .await
            .expect_err("should fail");

        assert_eq!(failure.attempts, 2);
        assert!(failure.error.to_string().contains("#2"));
        assert!(failure.context.is_retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = Arc::new(Mutex::new(0));
        let handler = RetryHandler::new(RetryPolicy::default());
        let failure = handler
            .execute_with_retry(
                |_| {
                    let calls = calls.clone();
                    async move {
                        *calls.lock().unwrap() += 1;
                        Err::<(), _>(NodeError::InvalidInput {
                            message: "expected a list".to_string(),
                        })
                    }
                },
                &IgnoreRetries,
            )
            .await
            .expect_err("should fail");

        assert_eq!(failure.attempts, 1);
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(failure.context.category, ErrorCategory::ValidationError);
    }
}
