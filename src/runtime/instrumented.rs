// SPDX-License-Identifier: MIT OR Apache-2.0

//! Observational outermost layer of the query client chain.
//!
//! [`InstrumentedClient`] opens a [`QuerySpan`] per call, attaches the breaker
//! state when the wrapped client exposes one, runs the call inside the span and
//! records its outcome on the span, in the metrics collector and in the log.
//! It never changes the outcome it observed.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use crate::client::{Account, EventTypeFilter, QueryClient, QueryOptions, QueryResult};
use crate::error::Result;
use crate::runtime::circuit_breaker::BreakerStatus;
use crate::runtime::classify::classify;
use crate::runtime::logging::{LoggingConfig, QueryLogger};
use crate::runtime::metrics::MetricsCollector;
use crate::runtime::tracing::{Operation, QuerySpan};

/// `QueryClient` layer that emits spans, metrics and logs for every call.
#[derive(Debug, Clone)]
pub struct InstrumentedClient<C> {
    inner: C,
    metrics: Option<Arc<MetricsCollector>>,
    logger: QueryLogger,
}

impl<C: QueryClient> InstrumentedClient<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            metrics: None,
            logger: QueryLogger::new(),
        }
    }

    /// Feed call outcomes into a metrics collector.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_logging(mut self, config: LoggingConfig) -> Self {
        self.logger = QueryLogger::with_config(config);
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsCollector>> {
        self.metrics.as_ref()
    }

    fn open(&self, span: QuerySpan) -> QuerySpan {
        if let Some(status) = self.inner.breaker_status() {
            span.record_breaker(status);
            if let Some(metrics) = &self.metrics {
                metrics.set_circuit_breaker_state(status.state);
            }
        }
        span
    }

    /// Record the outcome of a finished call. `count` extracts the result size.
    fn finish<T>(
        &self,
        span: QuerySpan,
        query: Option<&str>,
        result: &Result<T>,
        count: impl FnOnce(&T) -> usize,
    ) {
        let operation = span.operation();
        let (category, elapsed) = match result {
            Ok(value) => {
                let count = count(value);
                span.record_count(count);
                let elapsed = span.record_success();
                self.logger.log_success(operation, query, elapsed, count);
                (classify(None), elapsed)
            }
            Err(err) => {
                let elapsed = span.record_error(err);
                self.logger.log_failure(operation, query, elapsed, err);
                (err.category(), elapsed)
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_query(operation, category, elapsed);
            if let Some(status) = self.inner.breaker_status() {
                metrics.set_circuit_breaker_state(status.state);
            }
        }
    }
}

#[async_trait]
impl<C: QueryClient> QueryClient for InstrumentedClient<C> {
    async fn query_with_options(&self, query: &str, options: &QueryOptions) -> Result<QueryResult> {
        let span = self.open(QuerySpan::for_query(query, options));

        let result = self
            .inner
            .query_with_options(query, options)
            .instrument(span.span().clone())
            .await;

        if let Ok(found) = &result {
            span.record_result(found);
        }
        self.finish(span, Some(query), &result, |found| found.rows.len());
        result
    }

    async fn event_types(&self, filter: &EventTypeFilter) -> Result<Vec<String>> {
        let span = self.open(QuerySpan::for_operation(Operation::EventTypes));

        let result = self
            .inner
            .event_types(filter)
            .instrument(span.span().clone())
            .await;

        self.finish(span, None, &result, Vec::len);
        result
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        let span = self.open(QuerySpan::for_operation(Operation::Accounts));

        let result = self
            .inner
            .accounts()
            .instrument(span.span().clone())
            .await;

        self.finish(span, None, &result, Vec::len);
        result
    }

    fn breaker_status(&self) -> Option<BreakerStatus> {
        self.inner.breaker_status()
    }
}
