use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for statline collectors and the dispatcher.
#[derive(Error, Debug)]
pub enum CollectError {
    /// Connection, DNS, or timeout failure before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// The source answered HTTP 429 (or an equivalent throttling signal).
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        /// Server-provided minimum wait, if a Retry-After header was present.
        retry_after: Option<Duration>,
    },

    /// The source answered with a 5xx status.
    #[error("server error (HTTP {status}): {message}")]
    Server { message: String, status: u16 },

    /// The source answered with a 4xx status other than 429.
    #[error("client error (HTTP {status}): {message}")]
    Client { message: String, status: u16 },

    /// A response arrived but could not be parsed or decoded.
    #[error("content error: {0}")]
    Content(String),

    /// A task or parameter failed validation before any network call.
    #[error("validation error: {0}")]
    Validation(String),

    /// Persisting a result failed (disk, bucket upload).
    #[error("storage error: {0}")]
    Storage(String),

    /// Bad wiring: unknown source, duplicate registration, invalid settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure class used for retry decisions. First match wins: a 429 is
/// `RateLimit`, never generic `Client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    RateLimit,
    Server,
    Client,
    Content,
    Validation,
    Storage,
    Configuration,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Server => "server",
            ErrorCategory::Client => "client",
            ErrorCategory::Content => "content",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Configuration => "configuration",
        };
        write!(f, "{s}")
    }
}

/// Logging severity attached to each error class.
///
/// Drives tracing verbosity only; retry decisions come from
/// [`ErrorCategory`], never from severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl CollectError {
    /// Classify this error into its retry bucket.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CollectError::Network(_) => ErrorCategory::Network,
            CollectError::RateLimit { .. } => ErrorCategory::RateLimit,
            CollectError::Server { .. } => ErrorCategory::Server,
            CollectError::Client { .. } => ErrorCategory::Client,
            CollectError::Content(_) | CollectError::Serialization(_) => ErrorCategory::Content,
            CollectError::Validation(_) => ErrorCategory::Validation,
            CollectError::Storage(_) => ErrorCategory::Storage,
            CollectError::Configuration(_) => ErrorCategory::Configuration,
        }
    }

    pub fn severity(&self) -> Severity {
        match self.category() {
            ErrorCategory::RateLimit | ErrorCategory::Content => Severity::Low,
            ErrorCategory::Network | ErrorCategory::Client => Severity::Medium,
            ErrorCategory::Server | ErrorCategory::Validation | ErrorCategory::Storage => {
                Severity::High
            }
            ErrorCategory::Configuration => Severity::Critical,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network
                | ErrorCategory::RateLimit
                | ErrorCategory::Server
                | ErrorCategory::Content
                | ErrorCategory::Storage
        )
    }

    /// Returns true if this error should count against the circuit breaker.
    ///
    /// A 4xx means the endpoint is healthy and the request was wrong, so it
    /// never trips the circuit; the same goes for local validation, storage,
    /// and configuration failures.
    pub fn should_trip_circuit(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::RateLimit | ErrorCategory::Server
        )
    }

    /// The Retry-After hint, if this is a rate-limit error carrying one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CollectError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_429_classifies_as_rate_limit_not_client() {
        let err = CollectError::RateLimit {
            message: "HTTP 429 for https://stats.example.com".into(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.category(), ErrorCategory::RateLimit);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_retryable_categories() {
        assert!(CollectError::Network("connection reset".into()).is_retryable());
        assert!(
            CollectError::RateLimit {
                message: "too many requests".into(),
                retry_after: None,
            }
            .is_retryable()
        );
        assert!(
            CollectError::Server {
                message: "bad gateway".into(),
                status: 502,
            }
            .is_retryable()
        );
        assert!(CollectError::Content("truncated JSON".into()).is_retryable());
        assert!(CollectError::Storage("disk full".into()).is_retryable());
    }

    #[test]
    fn test_permanent_categories() {
        assert!(
            !CollectError::Client {
                message: "not found".into(),
                status: 404,
            }
            .is_retryable()
        );
        assert!(!CollectError::Validation("empty source".into()).is_retryable());
        assert!(!CollectError::Configuration("duplicate registration".into()).is_retryable());
    }

    #[test]
    fn test_circuit_tripping() {
        assert!(CollectError::Network("timeout".into()).should_trip_circuit());
        assert!(
            CollectError::Server {
                message: "oops".into(),
                status: 500,
            }
            .should_trip_circuit()
        );
        assert!(
            !CollectError::Client {
                message: "gone".into(),
                status: 410,
            }
            .should_trip_circuit()
        );
        assert!(!CollectError::Content("bad payload".into()).should_trip_circuit());
    }

    #[test]
    fn test_serialization_errors_are_content() {
        let err: CollectError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert_eq!(err.category(), ErrorCategory::Content);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_severity_is_ordered() {
        assert!(Severity::Low < Severity::Critical);
        assert_eq!(
            CollectError::Configuration("bad".into()).severity(),
            Severity::Critical
        );
    }
}
