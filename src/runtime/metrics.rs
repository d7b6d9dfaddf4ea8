// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prometheus-compatible metrics for the query client.
//!
//! This module provides an in-process metrics collector that the
//! instrumentation and retry layers feed, exportable in Prometheus text format.
//!
//! # Features
//!
//! - Query counters by operation, status and error category
//! - Query duration histograms
//! - Circuit breaker state and rejection metrics
//! - Retry counters
//!
//! # Example
//!
//! ```rust
//! use telemetry_query_rs::runtime::metrics::{MetricsCollector, MetricsConfig};
//! use telemetry_query_rs::runtime::{ErrorCategory, Operation};
//!
//! let config = MetricsConfig::builder()
//!     .namespace("myapp")
//!     .operation_label(true)
//!     .build();
//!
//! let metrics = MetricsCollector::new(config);
//!
//! metrics.record_query(Operation::Query, ErrorCategory::None, std::time::Duration::from_millis(42));
//!
//! let output = metrics.to_prometheus_text();
//! assert!(output.contains("myapp_queries_total"));
//! ```

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::runtime::circuit_breaker::CircuitState;
use crate::runtime::classify::ErrorCategory;
use crate::runtime::tracing::Operation;

/// Configuration for the metrics collector.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric namespace prefix (e.g., "telemetry_query" -> "telemetry_query_queries_total")
    pub namespace: String,
    /// Include the operation as a label
    pub operation_label: bool,
    /// Histogram buckets for query duration (in seconds)
    pub histogram_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: "telemetry_query".to_string(),
            operation_label: true,
            histogram_buckets: vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ],
        }
    }
}

impl MetricsConfig {
    /// Create a new builder for `MetricsConfig`.
    pub fn builder() -> MetricsConfigBuilder {
        MetricsConfigBuilder::default()
    }
}

/// Builder for `MetricsConfig`.
#[derive(Debug, Default)]
pub struct MetricsConfigBuilder {
    namespace: Option<String>,
    operation_label: Option<bool>,
    histogram_buckets: Option<Vec<f64>>,
}

impl MetricsConfigBuilder {
    /// Set the metric namespace prefix.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Enable or disable operation labels.
    pub fn operation_label(mut self, enabled: bool) -> Self {
        self.operation_label = Some(enabled);
        self
    }

    /// Set histogram buckets for query duration (in seconds).
    pub fn histogram_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.histogram_buckets = Some(buckets);
        self
    }

    /// Build the `MetricsConfig`.
    pub fn build(self) -> MetricsConfig {
        let default = MetricsConfig::default();
        MetricsConfig {
            namespace: self.namespace.unwrap_or(default.namespace),
            operation_label: self.operation_label.unwrap_or(default.operation_label),
            histogram_buckets: self.histogram_buckets.unwrap_or(default.histogram_buckets),
        }
    }
}

/// Labels of one `queries_total` sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryLabels {
    operation: Option<Operation>,
    error_type: ErrorCategory,
}

impl QueryLabels {
    fn status(&self) -> &'static str {
        if self.error_type == ErrorCategory::None {
            "success"
        } else {
            "error"
        }
    }
}

/// A single histogram with cumulative bucket counters.
#[derive(Debug)]
struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_nanos: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_nanos: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let secs = duration.as_secs_f64();
        // values above the last bucket only land in +Inf, which is the total count
        for (bucket, count) in self.buckets.iter().zip(&self.counts) {
            if secs <= *bucket {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn sum_secs(&self) -> f64 {
        self.sum_nanos.load(Ordering::Relaxed) as f64 / 1_000_000_000.0
    }

    fn total_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Thread-safe metrics collector for the query client.
#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    /// Counter: queries_total{operation, status, error_type}
    queries_total: RwLock<HashMap<QueryLabels, AtomicU64>>,
    /// Histogram: query_duration_seconds{operation}
    query_duration: RwLock<HashMap<Option<Operation>, Histogram>>,
    /// Gauge: circuit_breaker_state (0=closed, 1=half-open, 2=open)
    circuit_breaker_state: AtomicU64,
    /// Counter: circuit_breaker_rejections_total
    circuit_breaker_rejections: AtomicU64,
    /// Counter: query_retries_total
    retries_total: AtomicU64,
    start_time: Instant,
}

impl MetricsCollector {
    /// Create a new metrics collector with the given configuration.
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            queries_total: RwLock::new(HashMap::new()),
            query_duration: RwLock::new(HashMap::new()),
            circuit_breaker_state: AtomicU64::new(CircuitState::Closed.gauge_value()),
            circuit_breaker_rejections: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Create a new metrics collector with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(MetricsConfig::default())
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    fn operation_key(&self, operation: Operation) -> Option<Operation> {
        self.config.operation_label.then_some(operation)
    }

    /// Record a completed call with its error category (`None` for success).
    pub fn record_query(&self, operation: Operation, error_type: ErrorCategory, duration: Duration) {
        let labels = QueryLabels {
            operation: self.operation_key(operation),
            error_type,
        };

        {
            let counters = self
                .queries_total
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(counter) = counters.get(&labels) {
                counter.fetch_add(1, Ordering::Relaxed);
            } else {
                drop(counters);
                self.queries_total
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(labels)
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        if error_type == ErrorCategory::CircuitBreaker {
            self.record_circuit_breaker_rejection();
        }

        let key = self.operation_key(operation);
        let histograms = self
            .query_duration
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(hist) = histograms.get(&key) {
            hist.observe(duration);
        } else {
            drop(histograms);
            self.query_duration
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key)
                .or_insert_with(|| Histogram::new(self.config.histogram_buckets.clone()))
                .observe(duration);
        }
    }

    /// Update the circuit breaker state gauge.
    pub fn set_circuit_breaker_state(&self, state: CircuitState) {
        self.circuit_breaker_state
            .store(state.gauge_value(), Ordering::Relaxed);
    }

    /// Record a circuit breaker rejection.
    pub fn record_circuit_breaker_rejection(&self) {
        self.circuit_breaker_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record extra attempts made by the retry layer for one call.
    pub fn record_retries(&self, retries: u32) {
        if retries > 0 {
            self.retries_total
                .fetch_add(u64::from(retries), Ordering::Relaxed);
        }
    }

    /// Get the total number of recorded calls.
    pub fn total_queries(&self) -> u64 {
        self.count_where(|_| true)
    }

    /// Get the number of successful calls.
    pub fn successful_queries(&self) -> u64 {
        self.count_where(|labels| labels.error_type == ErrorCategory::None)
    }

    /// Get the number of failed calls.
    pub fn failed_queries(&self) -> u64 {
        self.count_where(|labels| labels.error_type != ErrorCategory::None)
    }

    /// Get the number of failed calls in one error category.
    pub fn failures_of(&self, category: ErrorCategory) -> u64 {
        self.count_where(|labels| labels.error_type == category)
    }

    fn count_where(&self, predicate: impl Fn(&QueryLabels) -> bool) -> u64 {
        self.queries_total
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(labels, _)| predicate(labels))
            .map(|(_, count)| count.load(Ordering::Relaxed))
            .sum()
    }

    /// Get collector uptime.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus_text(&self) -> String {
        let mut output = String::new();
        let ns = &self.config.namespace;

        // writing into a String cannot fail
        let _ = writeln!(output, "# HELP {ns}_queries_total Total number of client calls");
        let _ = writeln!(output, "# TYPE {ns}_queries_total counter");
        {
            let counters = self
                .queries_total
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (labels, count) in counters.iter() {
                let mut parts = Vec::with_capacity(3);
                if let Some(operation) = labels.operation {
                    parts.push(format!("operation=\"{operation}\""));
                }
                parts.push(format!("status=\"{}\"", labels.status()));
                parts.push(format!("error_type=\"{}\"", labels.error_type));
                let _ = writeln!(
                    output,
                    "{ns}_queries_total{{{}}} {}",
                    parts.join(","),
                    count.load(Ordering::Relaxed)
                );
            }
        }
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP {ns}_query_duration_seconds Client call duration in seconds"
        );
        let _ = writeln!(output, "# TYPE {ns}_query_duration_seconds histogram");
        {
            let histograms = self
                .query_duration
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (operation, hist) in histograms.iter() {
                let base = operation
                    .map(|op| format!("operation=\"{op}\","))
                    .unwrap_or_default();
                for (bucket, count) in hist.buckets.iter().zip(&hist.counts) {
                    let _ = writeln!(
                        output,
                        "{ns}_query_duration_seconds_bucket{{{base}le=\"{bucket}\"}} {}",
                        count.load(Ordering::Relaxed)
                    );
                }
                let total = hist.total_count();
                let _ = writeln!(
                    output,
                    "{ns}_query_duration_seconds_bucket{{{base}le=\"+Inf\"}} {total}"
                );

                let plain = base.trim_end_matches(',');
                let labels = if plain.is_empty() {
                    String::new()
                } else {
                    format!("{{{plain}}}")
                };
                let _ = writeln!(
                    output,
                    "{ns}_query_duration_seconds_sum{labels} {}",
                    hist.sum_secs()
                );
                let _ = writeln!(output, "{ns}_query_duration_seconds_count{labels} {total}");
            }
        }
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP {ns}_circuit_breaker_state Circuit breaker state (0=closed, 1=half-open, 2=open)"
        );
        let _ = writeln!(output, "# TYPE {ns}_circuit_breaker_state gauge");
        let _ = writeln!(
            output,
            "{ns}_circuit_breaker_state {}\n",
            self.circuit_breaker_state.load(Ordering::Relaxed)
        );

        let _ = writeln!(
            output,
            "# HELP {ns}_circuit_breaker_rejections_total Calls rejected by the circuit breaker"
        );
        let _ = writeln!(output, "# TYPE {ns}_circuit_breaker_rejections_total counter");
        let _ = writeln!(
            output,
            "{ns}_circuit_breaker_rejections_total {}\n",
            self.circuit_breaker_rejections.load(Ordering::Relaxed)
        );

        let _ = writeln!(
            output,
            "# HELP {ns}_query_retries_total Extra attempts made by the retry layer"
        );
        let _ = writeln!(output, "# TYPE {ns}_query_retries_total counter");
        let _ = writeln!(
            output,
            "{ns}_query_retries_total {}\n",
            self.retries_total.load(Ordering::Relaxed)
        );

        let _ = writeln!(output, "# HELP {ns}_uptime_seconds Collector uptime in seconds");
        let _ = writeln!(output, "# TYPE {ns}_uptime_seconds gauge");
        let _ = writeln!(
            output,
            "{ns}_uptime_seconds {}",
            self.uptime().as_secs_f64()
        );

        output
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_queries: self.total_queries(),
            successful_queries: self.successful_queries(),
            failed_queries: self.failed_queries(),
            circuit_breaker_state: self.circuit_breaker_state.load(Ordering::Relaxed),
            circuit_breaker_rejections: self.circuit_breaker_rejections.load(Ordering::Relaxed),
            retries: self.retries_total.load(Ordering::Relaxed),
            uptime: self.uptime(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Snapshot of current metrics for programmatic access.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    /// Circuit breaker state (0=closed, 1=half-open, 2=open)
    pub circuit_breaker_state: u64,
    pub circuit_breaker_rejections: u64,
    /// Extra attempts made by the retry layer
    pub retries: u64,
    pub uptime: Duration,
}
