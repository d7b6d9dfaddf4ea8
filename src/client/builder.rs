// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use crate::client::QueryClient;
use crate::config::QueryClientConfig;
use crate::error::Result;
use crate::runtime::metrics::MetricsCollector;
use crate::runtime::{
    CircuitBreaker, CircuitBreakerClient, CircuitBreakerConfig, InstrumentedClient,
    LoggingConfig, RetryClient, RetryConfig,
};

/// The full chain: instrumentation over circuit breaker over retry over `C`.
pub type ResilientClient<C> = InstrumentedClient<CircuitBreakerClient<RetryClient<C>>>;

/// Assembles a [`ResilientClient`] around a base client.
///
/// The layer order is fixed. Retries happen inside a single breaker
/// admission, so a retried call counts as one breaker outcome, and the span
/// covers the whole call including breaker rejections.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use telemetry_query_rs::client::{BaseClient, QueryClientBuilder};
/// use telemetry_query_rs::runtime::{CircuitBreakerConfig, RetryConfig};
/// use telemetry_query_rs::testkit::MockTransport;
///
/// let client = QueryClientBuilder::new(BaseClient::new(MockTransport::new()))
///     .circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(3))
///     .retry(RetryConfig::builder().max_attempts(2).build().unwrap())
///     .build()
///     .unwrap();
/// # let _ = client;
/// ```
#[derive(Debug)]
pub struct QueryClientBuilder<C> {
    base: C,
    breaker: CircuitBreakerConfig,
    retry: RetryConfig,
    metrics: Option<Arc<MetricsCollector>>,
    logging: LoggingConfig,
}

impl<C: QueryClient> QueryClientBuilder<C> {
    /// Start a chain around `base` with default breaker, retry and logging settings.
    pub fn new(base: C) -> Self {
        Self {
            base,
            breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            metrics: None,
            logging: LoggingConfig::default(),
        }
    }

    /// Take breaker and retry settings from a loaded configuration.
    pub fn from_config(base: C, config: &QueryClientConfig) -> Self {
        Self::new(base)
            .circuit_breaker(config.circuit_breaker.clone())
            .retry(config.retry.clone())
    }

    #[must_use]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    #[must_use]
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Feed spans' outcomes, breaker state and retries into `metrics`.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn logging(mut self, config: LoggingConfig) -> Self {
        self.logging = config;
        self
    }

    /// Build the chain.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Config` if the breaker or retry settings are invalid.
    pub fn build(self) -> Result<ResilientClient<C>> {
        let retry = self.retry.validate()?;
        let breaker = Arc::new(CircuitBreaker::new(self.breaker)?);

        let mut retrying = RetryClient::new(self.base, retry);
        if let Some(metrics) = &self.metrics {
            retrying = retrying.with_metrics(Arc::clone(metrics));
        }

        let guarded = CircuitBreakerClient::new(retrying, breaker);

        let mut instrumented = InstrumentedClient::new(guarded).with_logging(self.logging);
        if let Some(metrics) = self.metrics {
            instrumented = instrumented.with_metrics(metrics);
        }
        Ok(instrumented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BaseClient;
    use crate::runtime::CircuitState;
    use crate::testkit::MockTransport;
    use std::time::Duration;

    #[test]
    fn test_invalid_breaker_config_fails_build() {
        let result = QueryClientBuilder::new(BaseClient::new(MockTransport::new()))
            .circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(0))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_config_uses_settings() {
        let config = QueryClientConfig::from_yaml(
            "circuitBreaker:\n  failureThreshold: 7\nretry:\n  maxAttempts: 2\n",
        )
        .unwrap();

        let client = QueryClientBuilder::from_config(BaseClient::new(MockTransport::new()), &config)
            .build()
            .unwrap();

        let breaker = client.inner().breaker();
        assert_eq!(breaker.config().failure_threshold, 7);
        assert_eq!(breaker.config().open_duration, Duration::from_secs(30));
        assert_eq!(client.inner().inner().config().max_attempts(), 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
