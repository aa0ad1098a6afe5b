use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub retry_after_ms: Option<u64>,
}

impl RateLimitInfo {
    pub fn new(retry_after_ms: Option<u64>) -> Self {
        Self { retry_after_ms }
    }
}

impl fmt::Display for RateLimitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.retry_after_ms {
            Some(ms) => write!(f, " (retry after {ms}ms)"),
            None => Ok(()),
        }
    }
}

impl std::error::Error for RateLimitInfo {}

/// Classified failure of the reasoning service.
#[derive(Debug, Error)]
pub enum LLMError {
    #[error("rate limited{0}")]
    RateLimited(#[source] RateLimitInfo),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("timeout")]
    Timeout,
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("provider error: {0}")]
    ProviderError(String),
}

impl LLMError {
    /// Short machine-readable label used in diagnosis outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            LLMError::RateLimited(_) => "rate_limited",
            LLMError::AuthenticationFailed => "authentication_failed",
            LLMError::InvalidRequest(_) => "invalid_request",
            LLMError::ServerError(_) => "server_error",
            LLMError::Timeout => "timeout",
            LLMError::ParseError(_) => "parse_error",
            LLMError::ProviderError(_) => "provider_error",
        }
    }
}
