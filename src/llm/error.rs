//! Model client error types with retry and outcome classification.
//!
//! Transient errors are retried by the HTTP client. Cancellation and timeout
//! are reported as a cancelled task rather than a failed one.

use std::time::Duration;

/// Error from a model call.
#[derive(Debug, Clone)]
pub struct ModelError {
    pub kind: ModelErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    pub message: String,
    /// Server-provided delay from a `Retry-After` header
    pub retry_after: Option<Duration>,
}

impl ModelError {
    fn with_kind(kind: ModelErrorKind, status_code: Option<u16>, message: String) -> Self {
        Self {
            kind,
            status_code,
            message,
            retry_after: None,
        }
    }

    /// The execution context was cancelled while the call was in flight.
    pub fn cancelled() -> Self {
        Self::with_kind(
            ModelErrorKind::Cancelled,
            None,
            "request cancelled".to_string(),
        )
    }

    pub fn timeout(message: String) -> Self {
        Self::with_kind(ModelErrorKind::Timeout, None, message)
    }

    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::with_kind(ModelErrorKind::RateLimited, Some(429), message)
        }
    }

    pub fn server_error(status_code: u16, message: String) -> Self {
        Self::with_kind(ModelErrorKind::ServerError, Some(status_code), message)
    }

    /// Bad request, auth failure, unknown model, ...
    pub fn client_error(status_code: u16, message: String) -> Self {
        Self::with_kind(ModelErrorKind::ClientError, Some(status_code), message)
    }

    pub fn network_error(message: String) -> Self {
        Self::with_kind(ModelErrorKind::NetworkError, None, message)
    }

    pub fn parse_error(message: String) -> Self {
        Self::with_kind(ModelErrorKind::ParseError, None, message)
    }

    /// Build an error from a non-success HTTP status.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match classify_http_status(status) {
            ModelErrorKind::RateLimited => Self::rate_limited(message, retry_after),
            ModelErrorKind::ClientError => Self::client_error(status, message),
            ModelErrorKind::Timeout => Self {
                status_code: Some(status),
                ..Self::timeout(message)
            },
            _ => Self {
                retry_after,
                ..Self::server_error(status, message)
            },
        }
    }

    /// Whether the task should end `Canceled` instead of `Failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.kind,
            ModelErrorKind::Cancelled | ModelErrorKind::Timeout
        )
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Delay before retry attempt `attempt` (0-based).
    ///
    /// Uses `retry_after` when the server sent one, otherwise exponential
    /// backoff from a per-kind base, capped at 60 seconds.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after;
        }

        let base_secs: u64 = match self.kind {
            ModelErrorKind::RateLimited => 5,
            ModelErrorKind::ServerError => 2,
            _ => 1,
        };
        let delay_secs = base_secs.saturating_mul(2u64.saturating_pow(attempt));

        // Deterministic jitter, up to a quarter of the delay
        let jitter_range = delay_secs / 4;
        let jitter = if jitter_range > 0 {
            (attempt as u64 * 7) % jitter_range
        } else {
            0
        };

        Duration::from_secs(delay_secs.saturating_add(jitter).min(60))
    }
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ModelError::timeout(err.to_string())
        } else if err.is_decode() {
            ModelError::parse_error(err.to_string())
        } else if let Some(status) = err.status() {
            ModelError::from_status(status.as_u16(), err.to_string(), None)
        } else {
            ModelError::network_error(err.to_string())
        }
    }
}

/// Classification of model errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    Cancelled,
    /// Request exceeded its deadline
    Timeout,
    /// 429 - transient
    RateLimited,
    /// 5xx - transient
    ServerError,
    /// Other 4xx - permanent
    ClientError,
    /// Connection failed - transient
    NetworkError,
    /// Unexpected response body - permanent
    ParseError,
}

impl ModelErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModelErrorKind::RateLimited | ModelErrorKind::ServerError | ModelErrorKind::NetworkError
        )
    }
}

impl std::fmt::Display for ModelErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelErrorKind::Cancelled => write!(f, "Cancelled"),
            ModelErrorKind::Timeout => write!(f, "Timeout"),
            ModelErrorKind::RateLimited => write!(f, "Rate limited"),
            ModelErrorKind::ServerError => write!(f, "Server error"),
            ModelErrorKind::ClientError => write!(f, "Client error"),
            ModelErrorKind::NetworkError => write!(f, "Network error"),
            ModelErrorKind::ParseError => write!(f, "Parse error"),
        }
    }
}

/// Retry policy for non-streaming requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Stop retrying once this much time has elapsed since the first attempt
    pub max_retry_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_retry_duration: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    pub fn should_retry(&self, error: &ModelError, attempt: u32) -> bool {
        error.is_transient() && attempt < self.max_retries
    }
}

/// Map an HTTP status code to an error kind.
pub fn classify_http_status(status: u16) -> ModelErrorKind {
    match status {
        429 => ModelErrorKind::RateLimited,
        408 => ModelErrorKind::Timeout,
        400..=499 => ModelErrorKind::ClientError,
        _ => ModelErrorKind::ServerError,
    }
}
