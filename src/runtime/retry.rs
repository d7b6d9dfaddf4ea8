// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policies and backoff for transient query failures.
//!
//! Failures are classified first; only transient categories (timeout,
//! rate limit, network) are retried. Every attempt and every backoff sleep
//! runs under the caller's [`CallBudget`], so a deadline bounds the whole
//! retried call and not a single attempt.
//!
//! # Example
//!
//! ```
//! use telemetry_query_rs::runtime::RetryConfig;
//! use std::time::Duration;
//!
//! let retry = RetryConfig::builder()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(5))
//!     .jitter_fraction(0.1)
//!     .build()
//!     .unwrap();
//! assert_eq!(retry.max_attempts(), 3);
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Span};

use crate::client::{Account, EventTypeFilter, QueryClient, QueryOptions, QueryResult};
use crate::config::deserialize_duration;
use crate::error::{QueryError, Result};
use crate::runtime::classify::ErrorCategory;
use crate::runtime::metrics::MetricsCollector;
use crate::runtime::tracing::attributes;

/// Defines a backoff strategy for retry delays.
pub trait BackoffStrategy: Clone + Send + Sync + 'static {
    /// Delay to wait after the given failed attempt (1-based).
    fn delay(&self, attempt: u32) -> Duration;
}

// =============================================================================
// Exponential Backoff
// =============================================================================

/// Exponential backoff with proportional jitter.
///
/// `delay(n) = min(max, min(max, base * 2^(n-1)) * (1 + u * jitter))` with `u`
/// drawn uniformly from `[0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff strategy.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, jitter_fraction: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_fraction: jitter_fraction.clamp(0.0, 1.0),
        }
    }

    /// Delay for `attempt` with an explicit jitter sample in `[0, 1)`.
    #[must_use]
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = capped * (1.0 + sample.clamp(0.0, 1.0) * self.jitter_fraction);
        Duration::try_from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
            .unwrap_or(self.max_delay)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5), 0.1)
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let sample = if self.jitter_fraction > 0.0 {
            rand::random::<f64>()
        } else {
            0.0
        };
        self.delay_with_sample(attempt, sample)
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Determines whether a classified failure should be retried.
pub trait RetryPolicy: Clone + Send + Sync + 'static {
    /// Returns `true` if the operation should be retried for this category.
    fn should_retry(&self, category: ErrorCategory) -> bool;
}

/// Default retry policy - retries timeouts, rate limits and network errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, category: ErrorCategory) -> bool {
        category.is_transient()
    }
}

/// Never retry - fail immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn should_retry(&self, _category: ErrorCategory) -> bool {
        false
    }
}

// =============================================================================
// Call Budget
// =============================================================================

/// The caller's total time budget and cancellation signal for one call.
#[derive(Debug, Clone, Default)]
pub struct CallBudget {
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
}

impl CallBudget {
    /// A budget without deadline or cancellation.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Start a budget for a call with the given options, measured from now.
    #[must_use]
    pub fn from_options(options: &QueryOptions) -> Self {
        Self {
            deadline: options.timeout.map(|timeout| Instant::now() + timeout),
            timeout: options.timeout,
            cancellation: options.cancellation.clone(),
        }
    }

    /// Bound the budget by a timeout from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self.timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Time left before the deadline, `None` when unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns `true` once the deadline passed or the call was cancelled.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
            || self
                .cancellation
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
    }

    /// Run one attempt under the budget.
    ///
    /// # Errors
    ///
    /// Returns the attempt's own error, `QueryError::Timeout` when the deadline
    /// elapses first, or `QueryError::Cancelled` when the caller cancels.
    pub async fn run<T, Fut>(&self, attempt: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.race(attempt).await.unwrap_or_else(Err)
    }

    /// Race one attempt against the budget. The outer `Err` means the budget
    /// ended first and carries the matching `Timeout` or `Cancelled` error.
    async fn race<T, Fut>(&self, attempt: Fut) -> std::result::Result<Result<T>, QueryError>
    where
        Fut: Future<Output = Result<T>>,
    {
        tokio::select! {
            result = attempt => Ok(result),
            () = self.deadline_elapsed() => Err(QueryError::Timeout(format!(
                "deadline of {:?} exceeded",
                self.timeout.unwrap_or_default()
            ))),
            () = self.cancelled() => Err(QueryError::Cancelled(
                "query cancelled by caller".to_string(),
            )),
        }
    }

    /// Sleep for `delay` unless the budget ends first.
    ///
    /// Returns `false` without waiting out the delay when the deadline would
    /// pass before it ends or the call is cancelled meanwhile.
    pub async fn sleep(&self, delay: Duration) -> bool {
        if self.remaining().is_some_and(|remaining| remaining <= delay) {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = self.cancelled() => false,
        }
    }

    async fn deadline_elapsed(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    async fn cancelled(&self) {
        match &self.cancellation {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }
}

// =============================================================================
// Retry Configuration
// =============================================================================

/// Validated retry configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawRetryConfig")]
pub struct RetryConfig {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_fraction: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// A configuration that makes exactly one attempt.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Maximum number of attempts, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the first failed attempt.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Upper bound of any single backoff delay.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Jitter as a fraction of the computed delay.
    #[must_use]
    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction
    }

    /// Backoff strategy described by this configuration.
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base_delay, self.max_delay, self.jitter_fraction)
    }

    /// Check the configured values, returning the config unchanged when valid.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Config` describing the first invalid field.
    pub fn validate(self) -> Result<Self> {
        if self.max_attempts == 0 {
            return Err(QueryError::Config(
                "retry maxAttempts must be at least 1".to_string(),
            ));
        }
        if self.base_delay.is_zero() {
            return Err(QueryError::Config(
                "retry baseDelay must be greater than zero".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(QueryError::Config(format!(
                "retry maxDelay ({:?}) must not be below baseDelay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        if !self.jitter_fraction.is_finite() || !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(QueryError::Config(format!(
                "retry jitterFraction must be within [0, 1], got {}",
                self.jitter_fraction
            )));
        }
        Ok(self)
    }

    /// Execute an async operation with the default policy and backoff.
    ///
    /// `operation` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error, tagged with the number of attempts.
    pub async fn execute<T, F, Fut>(&self, budget: &CallBudget, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(&DefaultRetryPolicy, &self.backoff(), budget, operation)
            .await
    }

    /// Execute an async operation with an explicit policy and backoff.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error, tagged with the number of attempts.
    pub async fn execute_with<T, F, Fut, P, B>(
        &self,
        policy: &P,
        backoff: &B,
        budget: &CallBudget,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: RetryPolicy,
        B: BackoffStrategy,
    {
        self.execute_counted(policy, backoff, budget, operation)
            .await
            .0
    }

    /// Like [`execute_with`](Self::execute_with), also returning the number
    /// of attempts made. The count is recorded as `query.attempts` on the
    /// current span.
    pub(crate) async fn execute_counted<T, F, Fut, P, B>(
        &self,
        policy: &P,
        backoff: &B,
        budget: &CallBudget,
        operation: F,
    ) -> (Result<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: RetryPolicy,
        B: BackoffStrategy,
    {
        let (result, attempts) = self.attempt_loop(policy, backoff, budget, operation).await;
        Span::current().record(attributes::QUERY_ATTEMPTS, attempts);
        (result, attempts)
    }

    async fn attempt_loop<T, F, Fut, P, B>(
        &self,
        policy: &P,
        backoff: &B,
        budget: &CallBudget,
        mut operation: F,
    ) -> (Result<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: RetryPolicy,
        B: BackoffStrategy,
    {
        let mut attempt = 0;
        let mut last_error: Option<QueryError> = None;

        loop {
            attempt += 1;
            let error = match budget.race(operation(attempt)).await {
                Ok(Ok(result)) => return (Ok(result), attempt),
                Ok(Err(e)) => e,
                Err(cut) => {
                    // keep the previous real failure over the budget's own error
                    return match last_error.take() {
                        Some(previous) => {
                            debug!(attempt, "call budget ended during attempt");
                            let completed = attempt - 1;
                            (Err(previous.with_attempts(completed)), completed)
                        }
                        None => (Err(cut.with_attempts(attempt)), attempt),
                    };
                }
            };

            let category = error.category();
            if !policy.should_retry(category) {
                return (Err(error.with_attempts(attempt)), attempt);
            }

            if attempt >= self.max_attempts {
                if attempt > 1 {
                    warn!(attempts = attempt, error.type = %category, "giving up after retries");
                }
                return (Err(error.with_attempts(attempt)), attempt);
            }

            let delay = backoff.delay(attempt);
            debug!(
                attempt,
                error.type = %category,
                delay_ms = delay.as_millis() as u64,
                "retrying query after transient failure"
            );
            if !budget.sleep(delay).await {
                debug!(attempt, "call budget ended during backoff");
                return (Err(error.with_attempts(attempt)), attempt);
            }
            last_error = Some(error);
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawRetryConfig {
    max_attempts: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    base_delay: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    max_delay: Duration,
    jitter_fraction: f64,
}

impl Default for RawRetryConfig {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay: defaults.base_delay,
            max_delay: defaults.max_delay,
            jitter_fraction: defaults.jitter_fraction,
        }
    }
}

impl TryFrom<RawRetryConfig> for RetryConfig {
    type Error = QueryError;

    fn try_from(raw: RawRetryConfig) -> Result<Self> {
        RetryConfig {
            max_attempts: raw.max_attempts,
            base_delay: raw.base_delay,
            max_delay: raw.max_delay,
            jitter_fraction: raw.jitter_fraction,
        }
        .validate()
    }
}

/// Builder for `RetryConfig`.
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    /// Create a new builder with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    /// Set maximum attempts, including the first.
    #[must_use]
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.config.max_attempts = max;
        self
    }

    /// Set the delay after the first failure.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set the jitter fraction.
    #[must_use]
    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.config.jitter_fraction = fraction;
        self
    }

    /// Validate and build the configuration.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Config` for out-of-range values.
    pub fn build(self) -> Result<RetryConfig> {
        self.config.validate()
    }
}

impl Default for RetryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Retry Layer
// =============================================================================

/// `QueryClient` layer that retries transient failures of the inner client.
#[derive(Debug, Clone)]
pub struct RetryClient<C> {
    inner: C,
    config: RetryConfig,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<C: QueryClient> RetryClient<C> {
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            metrics: None,
        }
    }

    /// Count extra attempts in the given collector.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn run<T, F, Fut>(&self, budget: &CallBudget, call: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let (result, attempts) = self
            .config
            .execute_counted(&DefaultRetryPolicy, &self.config.backoff(), budget, call)
            .await;
        if let Some(metrics) = &self.metrics {
            metrics.record_retries(attempts.saturating_sub(1));
        }
        result
    }
}

#[async_trait]
impl<C: QueryClient> QueryClient for RetryClient<C> {
    async fn query_with_options(&self, query: &str, options: &QueryOptions) -> Result<QueryResult> {
        let budget = CallBudget::from_options(options);
        let inner = &self.inner;
        self.run(&budget, move |_| {
            inner.query_with_options(query, options)
        })
        .await
    }

    async fn event_types(&self, filter: &EventTypeFilter) -> Result<Vec<String>> {
        let inner = &self.inner;
        self.run(&CallBudget::unbounded(), move |_| {
            inner.event_types(filter)
        })
        .await
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        let inner = &self.inner;
        self.run(&CallBudget::unbounded(), move |_| {
            inner.accounts()
        })
        .await
    }
}
