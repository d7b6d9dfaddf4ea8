// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trace spans for query client calls.
//!
//! Every call through [`InstrumentedClient`](crate::runtime::InstrumentedClient)
//! opens one [`QuerySpan`]. The span follows OpenTelemetry conventions where
//! they exist (`otel.status_code`, `error.message`) and uses the attribute
//! names in [`attributes`] everywhere else, so dashboards can rely on them.
//!
//! # Usage with `tracing` Crate
//!
//! The library only emits spans through `tracing`. Exporting them is up to the
//! application, e.g. with `tracing-opentelemetry`:
//!
//! ```rust,ignore
//! use tracing_subscriber::prelude::*;
//!
//! tracing_subscriber::registry()
//!     .with(tracing_opentelemetry::layer().with_tracer(tracer))
//!     .with(tracing_subscriber::fmt::layer())
//!     .init();
//! ```
//!
//! # Example: Manual Span Creation
//!
//! ```rust
//! use telemetry_query_rs::client::QueryOptions;
//! use telemetry_query_rs::runtime::QuerySpan;
//!
//! let span = QuerySpan::for_query("SELECT count(*) FROM Transaction", &QueryOptions::default());
//! let elapsed = span.record_success();
//! assert!(elapsed.as_secs() < 1);
//! ```
//!
//! # Attributes
//!
//! | Attribute | Description |
//! |-----------|-------------|
//! | `query.text` | Query text, at most 500 characters plus `...` |
//! | `query.length` | Character count of the full query |
//! | `query.account_id` / `query.timeout_ms` / `query.result_limit` | Options the caller supplied |
//! | `circuit_breaker.state` | `closed`, `open` or `half_open` |
//! | `circuit_breaker.failure_count` | Consecutive failures seen by the breaker |
//! | `result.count` | Rows (or names, accounts) returned |
//! | `result.facet_count` / `result.total_count` | From result metadata, when present |
//! | `query.duration_ms` | Elapsed time of the call |
//! | `query.attempts` | Attempts made by the retry layer |
//! | `error.type` | Error category, `none` on success |

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, field, info_span, Span};

use crate::client::{QueryOptions, QueryResult};
use crate::error::QueryError;
use crate::runtime::circuit_breaker::BreakerStatus;
use crate::runtime::classify::ErrorCategory;

/// Span attribute names.
pub mod attributes {
    pub const QUERY_TEXT: &str = "query.text";
    pub const QUERY_LENGTH: &str = "query.length";
    pub const QUERY_ACCOUNT_ID: &str = "query.account_id";
    pub const QUERY_TIMEOUT_MS: &str = "query.timeout_ms";
    pub const QUERY_RESULT_LIMIT: &str = "query.result_limit";
    pub const QUERY_DURATION_MS: &str = "query.duration_ms";
    pub const QUERY_ATTEMPTS: &str = "query.attempts";
    pub const BREAKER_STATE: &str = "circuit_breaker.state";
    pub const BREAKER_FAILURE_COUNT: &str = "circuit_breaker.failure_count";
    pub const RESULT_COUNT: &str = "result.count";
    pub const RESULT_FACET_COUNT: &str = "result.facet_count";
    pub const RESULT_TOTAL_COUNT: &str = "result.total_count";
    pub const ERROR_TYPE: &str = "error.type";
    pub const ERROR_MESSAGE: &str = "error.message";
    pub const OTEL_STATUS_CODE: &str = "otel.status_code";
}

/// Longest query text recorded on a span, in characters.
pub const MAX_QUERY_TEXT_CHARS: usize = 500;

/// Appended to query text that was cut short.
pub const TRUNCATION_MARKER: &str = "...";

/// The client operation a span, log line or metric belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Query,
    EventTypes,
    Accounts,
}

impl Operation {
    /// Label value used in metrics and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Query => "query",
            Operation::EventTypes => "event_types",
            Operation::Accounts => "accounts",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cut `text` to at most `max_chars` characters, appending `...` when cut.
///
/// Never splits a character.
#[must_use]
pub fn truncate_query(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => Cow::Owned(format!("{}{TRUNCATION_MARKER}", &text[..byte_index])),
        None => Cow::Borrowed(text),
    }
}

macro_rules! query_span {
    ($name:literal) => {
        info_span!(
            $name,
            query.text = field::Empty,
            query.length = field::Empty,
            query.account_id = field::Empty,
            query.timeout_ms = field::Empty,
            query.result_limit = field::Empty,
            circuit_breaker.state = field::Empty,
            circuit_breaker.failure_count = field::Empty,
            result.count = field::Empty,
            result.facet_count = field::Empty,
            result.total_count = field::Empty,
            query.duration_ms = field::Empty,
            query.attempts = field::Empty,
            error.type = field::Empty,
            error.message = field::Empty,
            otel.status_code = field::Empty,
        )
    };
}

/// A span for one client call.
///
/// The span is finished by [`record_success`](Self::record_success) or
/// [`record_error`](Self::record_error). If it is dropped before either
/// (the call panicked or its future was dropped), it is marked failed with
/// `error.type=unknown` on the way out.
#[derive(Debug)]
pub struct QuerySpan {
    span: Span,
    start: Instant,
    operation: Operation,
    finished: bool,
}

impl QuerySpan {
    /// Open a `telemetry.query` span tagged with the query and its options.
    pub fn for_query(query: &str, options: &QueryOptions) -> Self {
        let span = Self::new(query_span!("telemetry.query"), Operation::Query);

        let text = truncate_query(query, MAX_QUERY_TEXT_CHARS);
        span.span.record(attributes::QUERY_TEXT, &*text);
        span.span
            .record(attributes::QUERY_LENGTH, query.chars().count() as u64);
        if let Some(account_id) = &options.account_id {
            span.span.record(attributes::QUERY_ACCOUNT_ID, account_id.as_str());
        }
        if let Some(timeout) = options.timeout {
            span.span
                .record(attributes::QUERY_TIMEOUT_MS, timeout.as_millis() as u64);
        }
        if let Some(limit) = options.result_limit {
            span.span.record(attributes::QUERY_RESULT_LIMIT, u64::from(limit));
        }
        span
    }

    /// Open a span for an operation other than a query.
    pub fn for_operation(operation: Operation) -> Self {
        let span = match operation {
            Operation::Query => query_span!("telemetry.query"),
            Operation::EventTypes => query_span!("telemetry.event_types"),
            Operation::Accounts => query_span!("telemetry.accounts"),
        };
        Self::new(span, operation)
    }

    fn new(span: Span, operation: Operation) -> Self {
        Self {
            span,
            start: Instant::now(),
            operation,
            finished: false,
        }
    }

    /// Get the underlying `tracing::Span`.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Get elapsed time since span creation.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Attach the breaker's state and failure count.
    pub fn record_breaker(&self, status: BreakerStatus) {
        self.span
            .record(attributes::BREAKER_STATE, status.state.as_str());
        self.span
            .record(attributes::BREAKER_FAILURE_COUNT, u64::from(status.failure_count));
    }

    /// Attach row count and any facet or total count found in the metadata.
    pub fn record_result(&self, result: &QueryResult) {
        self.record_count(result.rows.len());
        if let Some(facets) = result.facet_count() {
            self.span.record(attributes::RESULT_FACET_COUNT, facets);
        }
        if let Some(total) = result.total_count() {
            self.span.record(attributes::RESULT_TOTAL_COUNT, total);
        }
    }

    pub fn record_count(&self, count: usize) {
        self.span.record(attributes::RESULT_COUNT, count as u64);
    }

    /// Mark the call successful and close the span. Returns the elapsed time.
    pub fn record_success(mut self) -> Duration {
        self.finished = true;
        let elapsed = self.start.elapsed();
        self.span
            .record(attributes::QUERY_DURATION_MS, elapsed.as_millis() as u64);
        self.span
            .record(attributes::ERROR_TYPE, ErrorCategory::None.as_str());
        self.span.record(attributes::OTEL_STATUS_CODE, "OK");
        elapsed
    }

    /// Mark the call failed, record the error inside the span and close it.
    /// Returns the elapsed time.
    pub fn record_error(mut self, err: &QueryError) -> Duration {
        self.finished = true;
        let elapsed = self.start.elapsed();
        let category = err.category();
        let message = err.to_string();

        self.span
            .record(attributes::QUERY_DURATION_MS, elapsed.as_millis() as u64);
        self.span.record(attributes::QUERY_ATTEMPTS, err.attempts());
        self.span.record(attributes::ERROR_TYPE, category.as_str());
        self.span.record(attributes::ERROR_MESSAGE, message.as_str());
        self.span.record(attributes::OTEL_STATUS_CODE, "ERROR");
        self.span.in_scope(|| {
            error!(error.type = %category, error.message = %message, "query failed");
        });
        elapsed
    }
}

impl Drop for QuerySpan {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.span.record(
            attributes::QUERY_DURATION_MS,
            self.start.elapsed().as_millis() as u64,
        );
        self.span
            .record(attributes::ERROR_TYPE, ErrorCategory::Unknown.as_str());
        self.span.record(
            attributes::ERROR_MESSAGE,
            "call ended before completing (panic or cancellation)",
        );
        self.span.record(attributes::OTEL_STATUS_CODE, "ERROR");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_query_untouched() {
        let query = "SELECT count(*) FROM Transaction";
        assert!(matches!(truncate_query(query, 500), Cow::Borrowed(_)));
        assert_eq!(truncate_query(query, 500), query);
    }

    #[test]
    fn test_truncate_exact_limit_untouched() {
        let query = "a".repeat(500);
        assert_eq!(truncate_query(&query, 500), query);
    }

    #[test]
    fn test_truncate_long_query() {
        let query = "x".repeat(600);
        let truncated = truncate_query(&query, MAX_QUERY_TEXT_CHARS);
        assert_eq!(truncated.chars().count(), 503);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert_eq!(&truncated[..500], &query[..500]);
    }

    #[test]
    fn test_truncate_counts_characters_not_bytes() {
        let query = "é".repeat(10);
        let truncated = truncate_query(&query, 4);
        assert_eq!(truncated, "éééé...");
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::Query.as_str(), "query");
        assert_eq!(Operation::EventTypes.to_string(), "event_types");
        assert_eq!(Operation::Accounts.as_str(), "accounts");
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_span_elapsed() {
        let span = QuerySpan::for_operation(Operation::Accounts);
        tokio::time::advance(Duration::from_millis(25)).await;
        assert_eq!(span.record_success(), Duration::from_millis(25));
    }

    #[test]
    fn test_query_span_records_without_subscriber() {
        let options = QueryOptions::default()
            .with_account_id("42")
            .with_result_limit(10);
        let span = QuerySpan::for_query("SELECT 1", &options);
        assert_eq!(span.operation(), Operation::Query);
        span.record_error(&QueryError::Timeout("slow".to_string()));
        // Span should not panic
    }
}
