//! Error types shared by the cache, transport, resilience and service layers.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classification driving retry and circuit decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network failure or 5xx response.
    Transient,
    /// The call exceeded its deadline.
    Timeout,
    /// The upstream (or the local limiter) refused the call for rate reasons.
    RateLimited,
    /// 4xx response or a request rejected before it was sent.
    Validation,
    /// The named circuit is open and the call was never attempted.
    CircuitOpen,
    /// A 2xx body that does not match the expected schema.
    InvalidResponse,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        Self::Transient,
        Self::Timeout,
        Self::RateLimited,
        Self::Validation,
        Self::CircuitOpen,
        Self::InvalidResponse,
        Self::Unknown,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Validation => "validation",
            Self::CircuitOpen => "circuit_open",
            Self::InvalidResponse => "invalid_response",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the retry loop may attempt this kind again.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::Timeout | Self::RateLimited | Self::Unknown
        )
    }

    /// Whether the failure says something about the health of the upstream.
    pub const fn counts_against_circuit(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::Timeout | Self::RateLimited | Self::Unknown
        )
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation name and parameters attached to an error once retries give up.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    pub operation: String,
    pub params: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Display) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }
}

/// Structured error produced by the API client and propagated by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    status: Option<u16>,
    retry_after: Option<Duration>,
    context: Option<ErrorContext>,
}

impl ApiError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
            context: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn circuit_open(circuit: &str) -> Self {
        Self::new(
            ErrorKind::CircuitOpen,
            format!("circuit '{circuit}' is open; call rejected without reaching the network"),
        )
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidResponse, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Classify a non-2xx response.
    pub fn from_status(status: u16, status_text: &str) -> Self {
        let message = if status_text.is_empty() {
            format!("upstream returned status {status}")
        } else {
            format!("upstream returned status {status} {status_text}")
        };

        let kind = match status {
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            400..=499 => ErrorKind::Validation,
            500..=599 => ErrorKind::Transient,
            _ => ErrorKind::Unknown,
        };

        Self {
            status: Some(status),
            ..Self::new(kind, message)
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    pub const fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        self.context.as_ref()
    }

    pub const fn retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(context) = &self.context {
            write!(f, " (operation '{}'", context.operation)?;
            for (key, value) in &context.params {
                write!(f, ", {key}={value}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

/// Input validation errors raised before any request is issued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("quote id cannot be empty")]
    EmptyQuoteId,
    #[error("quote id length {len} exceeds max {max}")]
    QuoteIdTooLong { len: usize, max: usize },
    #[error("quote id contains invalid character '{ch}' at index {index}")]
    QuoteIdInvalidChar { ch: char, index: usize },

    #[error("field '{field}' cannot be empty")]
    EmptyField { field: &'static str },
    #[error("bulk request must contain at least one quote id")]
    EmptyBulkRequest,
    #[error("rating {value} is out of range, expected 1-5")]
    RatingOutOfRange { value: u8 },

    #[error("invalid period '{value}', expected one of this_week, this_month, this_quarter, this_year, last_month, last_quarter, last_year")]
    InvalidPeriod { value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("base url must start with http:// or https://: '{value}'")]
    InvalidBaseUrl { value: String },
    #[error("configuration value '{field}' must be greater than zero")]
    ZeroValue { field: &'static str },
    #[error("configuration value '{field}' is {value}; expected {expected}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },
    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidEnv { name: &'static str, value: String },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level error returned by service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ServiceError {
    /// Error kind used by callers to pick a notification; validation and
    /// configuration problems both read as `Validation`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Api(error) => error.kind(),
            Self::Validation(_) | Self::Config(_) => ErrorKind::Validation,
        }
    }

    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(error) => Some(error),
            _ => None,
        }
    }

    /// Same failure expressed in the API taxonomy.
    pub fn to_api_error(&self) -> ApiError {
        match self {
            Self::Api(error) => error.clone(),
            other => ApiError::validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert_eq!(ApiError::from_status(400, "Bad Request").kind(), ErrorKind::Validation);
        assert_eq!(ApiError::from_status(404, "Not Found").kind(), ErrorKind::Validation);
        assert_eq!(ApiError::from_status(408, "").kind(), ErrorKind::Timeout);
        assert_eq!(ApiError::from_status(429, "").kind(), ErrorKind::RateLimited);
        assert_eq!(ApiError::from_status(503, "").kind(), ErrorKind::Transient);
        assert_eq!(ApiError::from_status(302, "").kind(), ErrorKind::Unknown);
    }

    #[test]
    fn status_text_is_carried_in_message() {
        let error = ApiError::from_status(502, "Bad Gateway");

        assert_eq!(error.status(), Some(502));
        assert!(error.message().contains("502 Bad Gateway"));
        assert!(error.retryable());
    }

    #[test]
    fn display_includes_context() {
        let error = ApiError::transient("connection reset").with_context(
            ErrorContext::new("fetch_margin_analysis").with_param("period", "this_month"),
        );

        let rendered = error.to_string();
        assert!(rendered.starts_with("transient: connection reset"));
        assert!(rendered.contains("operation 'fetch_margin_analysis'"));
        assert!(rendered.contains("period=this_month"));
    }

    #[test]
    fn non_retryable_kinds() {
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
        assert!(!ErrorKind::InvalidResponse.is_retryable());
        assert!(!ErrorKind::Validation.counts_against_circuit());
    }
}
