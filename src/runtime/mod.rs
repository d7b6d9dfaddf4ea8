// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runtime utilities for resilience and observability.
//!
//! This module provides the layers of the resilient query client: error
//! classification, retry policies, the circuit breaker, and the
//! instrumentation layer with its spans, metrics and logging.

mod circuit_breaker;
mod classify;
mod instrumented;
mod logging;
pub mod metrics;
mod retry;
pub mod tracing;

pub use circuit_breaker::{
    BreakerStatus, CircuitBreaker, CircuitBreakerClient, CircuitBreakerConfig, CircuitPermit,
    CircuitState,
};
pub use classify::{classify, classify_message, classify_status, ErrorCategory};
pub use instrumented::InstrumentedClient;
pub use logging::{LogLevel, LoggingConfig, QueryLogger, LOG_TARGET};
pub use metrics::{MetricsCollector, MetricsConfig, MetricsSnapshot};
pub use retry::{
    BackoffStrategy, CallBudget, DefaultRetryPolicy, ExponentialBackoff, NoRetryPolicy,
    RetryClient, RetryConfig, RetryConfigBuilder, RetryPolicy,
};
pub use self::tracing::{truncate_query, Operation, QuerySpan, MAX_QUERY_TEXT_CHARS, TRUNCATION_MARKER};
