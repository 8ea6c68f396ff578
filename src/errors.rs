use std::fmt;
use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("cache write failed: {0}")]
    Cache(String),
    #[error("invalid geometry: {0}")]
    Geo(String),
}

/// How a failed API call should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeouts, connection resets, 5xx.
    Transient,
    /// 429 / `RESOURCE_EXHAUSTED`. Retried with a longer backoff.
    QuotaExceeded,
    /// Invalid key, malformed request, unknown place. Never retried.
    Permanent,
    /// The run was interrupted before the call finished.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::Permanent => "permanent",
            FailureKind::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::QuotaExceeded)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind} failure after {attempts} attempt(s): {message}")]
pub struct FetchError {
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
    /// Set once the retry budget is spent on a retryable failure.
    pub exhausted: bool,
}

impl FetchError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts: 1,
            exhausted: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(FailureKind::QuotaExceeded, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "run cancelled")
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }

    pub(crate) fn with_attempts(mut self, attempts: u32, exhausted: bool) -> Self {
        self.attempts = attempts;
        self.exhausted = exhausted;
        self
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return FetchError::transient(err.to_string());
        }
        match err.status() {
            Some(status) => FetchError::new(classify_status(status.as_u16(), ""), err.to_string()),
            None if err.is_decode() => FetchError::permanent(format!("malformed response: {err}")),
            None => FetchError::transient(err.to_string()),
        }
    }
}

/// Maps an HTTP status (and the error body, which Google uses to signal quota
/// exhaustion on non-429 codes) onto a failure class.
pub fn classify_status(status: u16, body: &str) -> FailureKind {
    if status == 429 || body.contains("RESOURCE_EXHAUSTED") {
        return FailureKind::QuotaExceeded;
    }
    match status {
        408 | 425 => FailureKind::Transient,
        500..=599 => FailureKind::Transient,
        _ => FailureKind::Permanent,
    }
}
