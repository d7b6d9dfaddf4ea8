// SPDX-License-Identifier: MIT OR Apache-2.0

//! Failure classification.
//!
//! Every failure the client sees is mapped into one [`ErrorCategory`]. The
//! category drives retry decisions and is attached to spans, metrics and logs.
//!
//! Structured errors are classified by variant or HTTP status first. Free-text
//! messages are only inspected when no code is available, since substring
//! matching is brittle.

use std::fmt;

use crate::error::QueryError;

/// Classification taxonomy for query failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// No failure.
    None,
    /// The backend or the caller's deadline timed out.
    Timeout,
    /// The backend throttled the request.
    RateLimit,
    /// Missing or rejected credentials.
    Auth,
    /// The requested entity does not exist.
    NotFound,
    /// The query or its options were rejected as invalid.
    Validation,
    /// Connection-level failure.
    Network,
    /// Rejected locally by the circuit breaker.
    CircuitBreaker,
    /// Anything unrecognized.
    Unknown,
}

impl ErrorCategory {
    /// Attribute value used on spans, metrics and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::None => "none",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Auth => "auth",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Network => "network",
            ErrorCategory::CircuitBreaker => "circuit_breaker",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Transient categories that the default retry policy retries.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Timeout | ErrorCategory::RateLimit | ErrorCategory::Network
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an optional failure. `None` means the call succeeded.
#[must_use]
pub fn classify(error: Option<&QueryError>) -> ErrorCategory {
    let Some(error) = error else {
        return ErrorCategory::None;
    };

    match error.root() {
        QueryError::Timeout(_) | QueryError::Cancelled(_) => ErrorCategory::Timeout,
        QueryError::RateLimited(_) => ErrorCategory::RateLimit,
        QueryError::Unauthorized(_) => ErrorCategory::Auth,
        QueryError::NotFound(_) => ErrorCategory::NotFound,
        QueryError::Validation(_) | QueryError::Config(_) => ErrorCategory::Validation,
        QueryError::Connection(_) => ErrorCategory::Network,
        QueryError::CircuitOpen(_) => ErrorCategory::CircuitBreaker,
        QueryError::Http { status, message } => {
            classify_status(status.as_u16()).unwrap_or_else(|| classify_message(message))
        }
        QueryError::Backend(message) | QueryError::Unknown(message) => classify_message(message),
        // root() never returns a tag
        QueryError::Retried { .. } => ErrorCategory::Unknown,
    }
}

/// Map a transport status code to a category, if it carries one.
#[must_use]
pub fn classify_status(status: u16) -> Option<ErrorCategory> {
    match status {
        408 | 504 => Some(ErrorCategory::Timeout),
        429 => Some(ErrorCategory::RateLimit),
        401 | 403 => Some(ErrorCategory::Auth),
        404 => Some(ErrorCategory::NotFound),
        400 | 422 => Some(ErrorCategory::Validation),
        502 | 503 => Some(ErrorCategory::Network),
        _ => None,
    }
}

const TEXT_SIGNALS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Timeout,
        &["timeout", "timed out", "deadline exceeded"],
    ),
    (
        ErrorCategory::RateLimit,
        &["rate limit", "too many requests", "throttl"],
    ),
    (
        ErrorCategory::Auth,
        &[
            "unauthorized",
            "forbidden",
            "authentication",
            "permission denied",
            "api key",
        ],
    ),
    (
        ErrorCategory::NotFound,
        &["not found", "does not exist", "unknown event type"],
    ),
    (
        ErrorCategory::Validation,
        &[
            "validation",
            "invalid",
            "syntax error",
            "bad request",
            "parse error",
        ],
    ),
    (
        ErrorCategory::Network,
        &[
            "connection",
            "network",
            "dns",
            "broken pipe",
            "reset by peer",
            "unreachable",
            "eof",
        ],
    ),
    (ErrorCategory::CircuitBreaker, &["circuit breaker is open"]),
];

/// Substring fallback for failures that only carry text. First match wins.
#[must_use]
pub fn classify_message(message: &str) -> ErrorCategory {
    let message = message.to_lowercase();
    TEXT_SIGNALS
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| message.contains(needle)))
        .map_or(ErrorCategory::Unknown, |(category, _)| *category)
}
