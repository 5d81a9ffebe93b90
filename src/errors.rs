//! Error classification for provider failures.
//!
//! Every raw provider error is mapped into a `ClassifiedError` carrying a
//! category, a severity and a retryability flag. The retry engine and the
//! circuit breakers act on the classification, never on raw SDK errors.

use std::fmt;

use crate::prelude::*;

/// What kind of failure a provider error represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Authentication,
    Timeout,
    Connection,
    Server,
    Client,
    InvalidRequest,
    ContentFilter,
    Quota,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Server => "server",
            ErrorCategory::Client => "client",
            ErrorCategory::InvalidRequest => "invalid_request",
            ErrorCategory::ContentFilter => "content_filter",
            ErrorCategory::Quota => "quota",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Fixed severity per category.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ErrorCategory::Authentication | ErrorCategory::Quota => ErrorSeverity::Critical,
            ErrorCategory::Connection | ErrorCategory::Server => ErrorSeverity::High,
            ErrorCategory::ContentFilter => ErrorSeverity::Low,
            ErrorCategory::RateLimit
            | ErrorCategory::Timeout
            | ErrorCategory::Client
            | ErrorCategory::InvalidRequest
            | ErrorCategory::Unknown => ErrorSeverity::Medium,
        }
    }

    /// Whether the retry engine may retry this category. Unknown errors are
    /// conservatively not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimit
                | ErrorCategory::Timeout
                | ErrorCategory::Connection
                | ErrorCategory::Server
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad a failure is for the run as a whole.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider error after classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub is_retryable: bool,
    pub message: String,
    pub provider: String,
}

impl ClassifiedError {
    /// Build a classified error directly from a category, for failure modes
    /// we detect ourselves (timeouts, unparseable bodies).
    pub fn new(category: ErrorCategory, provider: &str, message: impl Into<String>) -> Self {
        Self {
            category,
            severity: category.severity(),
            is_retryable: category.is_retryable(),
            message: message.into(),
            provider: provider.to_owned(),
        }
    }

    /// A structured response body that failed to parse as JSON. Treated as a
    /// non-retryable invalid request.
    pub fn parse_failure(provider: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InvalidRequest, provider, message)
    }

    /// A call that exceeded its deadline.
    pub fn timeout(provider: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, provider, message)
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error from {} (severity={}, retryable={}): {}",
            self.category, self.provider, self.severity, self.is_retryable, self.message
        )
    }
}

/// Any failure surfaced by the provider layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{0}")]
    Classified(ClassifiedError),

    /// Raised instead of calling a provider whose circuit is open. Never
    /// retried; the caller elects a fallback provider instead.
    #[error("circuit breaker open for {provider}")]
    CircuitOpen { provider: String },
}

impl ProviderError {
    /// The classification, if this error carries one.
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            ProviderError::Classified(classified) => Some(classified),
            ProviderError::CircuitOpen { .. } => None,
        }
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        self.classified().map(|c| c.category)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ProviderError::CircuitOpen { .. })
    }
}

impl From<ClassifiedError> for ProviderError {
    fn from(classified: ClassifiedError) -> Self {
        ProviderError::Classified(classified)
    }
}

/// Classify a raw provider failure from its HTTP status (when known) and its
/// message text. Pure: the same inputs always produce the same output.
pub fn classify(provider: &str, status: Option<u16>, message: &str) -> ClassifiedError {
    let category = categorize(status, &message.to_lowercase());
    ClassifiedError::new(category, provider, message)
}

fn categorize(status: Option<u16>, lower: &str) -> ErrorCategory {
    // Message checks for the critical categories come first: quota failures
    // frequently arrive with a 429 status and must not be retried as rate
    // limits.
    if lower.contains("quota exceeded")
        || lower.contains("insufficient credit")
        || lower.contains("billing")
    {
        return ErrorCategory::Quota;
    }
    if lower.contains("invalid api key")
        || lower.contains("invalid x-api-key")
        || lower.contains("unauthorized")
        || lower.contains("permission denied")
    {
        return ErrorCategory::Authentication;
    }

    if let Some(status) = status {
        match status {
            429 => return ErrorCategory::RateLimit,
            401 | 403 => return ErrorCategory::Authentication,
            400 => return ErrorCategory::InvalidRequest,
            s if s >= 500 => return ErrorCategory::Server,
            s if (400..500).contains(&s) => return ErrorCategory::Client,
            _ => {}
        }
    }

    if lower.contains("rate limit") || lower.contains("too many requests") {
        ErrorCategory::RateLimit
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ErrorCategory::Timeout
    } else if lower.contains("connection")
        || lower.contains("dns")
        || lower.contains("socket")
        || lower.contains("reset by peer")
        || lower.contains("broken pipe")
    {
        ErrorCategory::Connection
    } else if lower.contains("content policy")
        || lower.contains("content_filter")
        || lower.contains("safety")
    {
        ErrorCategory::ContentFilter
    } else if lower.contains("invalid parameter") || lower.contains("invalid request") {
        ErrorCategory::InvalidRequest
    } else {
        ErrorCategory::Unknown
    }
}

/// Classify a `reqwest` transport or status error.
pub fn classify_reqwest(provider: &str, error: &reqwest::Error) -> ClassifiedError {
    if error.is_timeout() {
        return ClassifiedError::timeout(provider, error.to_string());
    }
    if error.is_connect() {
        return ClassifiedError::new(ErrorCategory::Connection, provider, error.to_string());
    }
    let status = error.status().map(|s| s.as_u16());
    classify(provider, status, &error.to_string())
}

/// Classify an `async-openai` SDK error.
pub fn classify_openai(provider: &str, error: &async_openai::error::OpenAIError) -> ClassifiedError {
    use async_openai::error::OpenAIError;

    match error {
        OpenAIError::Reqwest(inner) => classify_reqwest(provider, inner),
        OpenAIError::ApiError(api) => {
            // The OpenAI SDK surfaces the HTTP status only through the error
            // type/code strings, so classification falls back to substrings.
            let detail = format!(
                "{} (type={}, code={})",
                api.message,
                api.r#type
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "unknown".to_owned()),
                api.code
                    .as_ref()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_owned()),
            );
            classify(provider, None, &detail)
        }
        OpenAIError::JSONDeserialize(inner) => {
            ClassifiedError::parse_failure(provider, inner.to_string())
        }
        other => classify(provider, None, &other.to_string()),
    }
}
