// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

use crate::runtime::ErrorCategory;

#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Query timed out: {0}")]
    Timeout(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("Backend returned HTTP {status}: {message}")]
    Http {
        status: http::StatusCode,
        message: String,
    },

    /// Free-text failure from a transport that cannot supply a structured code.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Query cancelled: {0}")]
    Cancelled(String),

    /// The last failure of a retried call, tagged with the number of attempts made.
    #[error("{source} (after {attempts} attempts)")]
    Retried {
        attempts: u32,
        #[source]
        source: Box<QueryError>,
    },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl QueryError {
    /// The underlying failure, looking through any attempt tag.
    #[must_use]
    pub fn root(&self) -> &QueryError {
        match self {
            QueryError::Retried { source, .. } => source.root(),
            other => other,
        }
    }

    /// How many attempts produced this error (1 unless the retry layer tagged it).
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            QueryError::Retried { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// Tag the error with an attempt count. Single attempts are left untouched.
    #[must_use]
    pub fn with_attempts(self, attempts: u32) -> Self {
        if attempts <= 1 {
            return self;
        }
        match self {
            QueryError::Retried { source, .. } => QueryError::Retried { attempts, source },
            other => QueryError::Retried {
                attempts,
                source: Box::new(other),
            },
        }
    }

    /// Classify this error into the fixed taxonomy.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        crate::runtime::classify(Some(self))
    }

    /// Returns `true` if this is a circuit breaker rejection.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self.root(), QueryError::CircuitOpen(_))
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
