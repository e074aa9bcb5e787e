//! Error taxonomy shared by the limiter, the source wrappers and the resolver.
//!
//! Every provider failure is classified into one of these kinds before it
//! reaches the retry loop, so retry policy never inspects raw HTTP responses.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractError {
    #[error("{provider}: credentials are not configured")]
    MissingCredentials { provider: String },

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("payment required: {0}")]
    PaymentRequired(String),

    #[error("insufficient credits: {0}")]
    InsufficientCredits(String),

    /// Provider-side throttling (HTTP 429), distinct from our own limiter.
    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("circuit open for {provider}")]
    CircuitOpen { provider: String },

    #[error("{provider}: queued request not served within {waited:?}")]
    QueueTimeout { provider: String, waited: Duration },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("emergency stop active (spent {spent:.4} of {limit:.4})")]
    EmergencyStop { spent: f64, limit: f64 },

    #[error("source {provider} is disabled")]
    SourceDisabled { provider: String },

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("{provider} returned HTTP {status}: {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
    },
}

pub type ExtractResult<T> = Result<T, ExtractError>;

impl ExtractError {
    /// Whether the retry loop may try the operation again after a backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            ExtractError::RateLimited(_)
            | ExtractError::Timeout(_)
            | ExtractError::Network(_)
            | ExtractError::InvalidResponse(_) => true,
            ExtractError::Provider { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Pipeline guards (circuit, queue, emergency stop, config) are not provider
    /// failures and must not feed the circuit breaker.
    pub fn counts_as_source_failure(&self) -> bool {
        !matches!(
            self,
            ExtractError::CircuitOpen { .. }
                | ExtractError::QueueTimeout { .. }
                | ExtractError::EmergencyStop { .. }
                | ExtractError::SourceDisabled { .. }
                | ExtractError::UnknownSource(_)
                | ExtractError::InvalidUrl(_)
                | ExtractError::MissingCredentials { .. }
        )
    }

    /// The source cannot serve us until an operator acts (keys, billing, spend
    /// ceiling). A configured fallback value must not paper over these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExtractError::MissingCredentials { .. }
                | ExtractError::InvalidCredentials(_)
                | ExtractError::Unauthorized(_)
                | ExtractError::Forbidden(_)
                | ExtractError::PaymentRequired(_)
                | ExtractError::InsufficientCredits(_)
                | ExtractError::EmergencyStop { .. }
        )
    }

    /// Short stable label, used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractError::MissingCredentials { .. } => "missing_credentials",
            ExtractError::InvalidCredentials(_) => "invalid_credentials",
            ExtractError::Unauthorized(_) => "unauthorized",
            ExtractError::Forbidden(_) => "forbidden",
            ExtractError::NotFound(_) => "not_found",
            ExtractError::PaymentRequired(_) => "payment_required",
            ExtractError::InsufficientCredits(_) => "insufficient_credits",
            ExtractError::RateLimited(_) => "rate_limited",
            ExtractError::Timeout(_) => "timeout",
            ExtractError::Network(_) => "network",
            ExtractError::CircuitOpen { .. } => "circuit_open",
            ExtractError::QueueTimeout { .. } => "queue_timeout",
            ExtractError::InvalidResponse(_) => "invalid_response",
            ExtractError::EmergencyStop { .. } => "emergency_stop",
            ExtractError::SourceDisabled { .. } => "source_disabled",
            ExtractError::UnknownSource(_) => "unknown_source",
            ExtractError::InvalidUrl(_) => "invalid_url",
            ExtractError::Provider { .. } => "provider",
        }
    }

    /// Map an HTTP status (plus the body, which some providers use to signal
    /// credential or billing problems on a generic 400) to an error kind.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let message = truncate(body, 300);
        if let Some(classified) = Self::from_message(&message) {
            return classified;
        }
        match status {
            401 => ExtractError::Unauthorized(message),
            402 => ExtractError::PaymentRequired(message),
            403 => ExtractError::Forbidden(message),
            404 => ExtractError::NotFound(message),
            408 => ExtractError::Timeout(Duration::ZERO),
            429 => ExtractError::RateLimited(message),
            502..=504 => ExtractError::Network(format!("HTTP {status}: {message}")),
            _ => ExtractError::Provider {
                provider: provider.to_string(),
                status,
                message,
            },
        }
    }

    /// Recognise credential/billing failures from provider error text.
    pub fn from_message(message: &str) -> Option<Self> {
        let lower = message.to_ascii_lowercase();
        if lower.contains("api key not valid")
            || lower.contains("invalid api key")
            || lower.contains("invalid_api_key")
            || lower.contains("invalid credentials")
        {
            return Some(ExtractError::InvalidCredentials(message.to_string()));
        }
        if lower.contains("insufficient credits")
            || lower.contains("insufficient_credits")
            || lower.contains("credit balance")
            || lower.contains("quota exceeded for billing")
        {
            return Some(ExtractError::InsufficientCredits(message.to_string()));
        }
        None
    }

    /// Map a transport-level `reqwest` failure.
    pub fn from_reqwest(provider: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return ExtractError::Timeout(Duration::ZERO);
        }
        if let Some(status) = err.status() {
            return Self::from_status(provider, status.as_u16(), &err.to_string());
        }
        if err.is_decode() || err.is_body() {
            return ExtractError::InvalidResponse(format!("{provider}: {err}"));
        }
        ExtractError::Network(format!("{provider}: {err}"))
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        trimmed.chars().take(max_chars).collect()
    }
}
