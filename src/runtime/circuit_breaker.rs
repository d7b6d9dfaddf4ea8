// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit breaker pattern implementation for the query backend.
//!
//! The circuit breaker stops calling a failing backend for a cooldown period
//! and then probes it with a limited number of trial calls.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Calls are rejected immediately (backend is failing)
//! - **Half-Open**: Up to `half_open_max_attempts` trial calls are admitted
//!
//! The Open to Half-Open transition is evaluated lazily whenever the breaker
//! is consulted; there is no background timer.
//!
//! # Example
//!
//! ```ignore
//! use telemetry_query_rs::runtime::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let config = CircuitBreakerConfig::default()
//!     .with_failure_threshold(5)
//!     .with_open_duration(Duration::from_secs(30));
//!
//! let breaker = CircuitBreaker::new(config)?;
//!
//! let result = breaker.call(|| async {
//!     client.query("SELECT count(*) FROM Transaction").await
//! }).await;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::client::{Account, EventTypeFilter, QueryClient, QueryOptions, QueryResult};
use crate::config::deserialize_duration;
use crate::error::{QueryError, Result};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally.
    Closed,
    /// Circuit is open, calls fail immediately.
    Open,
    /// Circuit is half-open, probing whether the backend has recovered.
    HalfOpen,
}

impl CircuitState {
    /// Attribute value used on spans and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding (0=closed, 1=half-open, 2=open).
    #[must_use]
    pub fn gauge_value(&self) -> u64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker, read under a single lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawCircuitBreakerConfig")]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Cooldown before an open circuit admits trial calls.
    pub open_duration: Duration,
    /// Maximum concurrent trial calls while half-open.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_max_attempts: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the open duration.
    #[must_use]
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Set the maximum half-open trial calls.
    #[must_use]
    pub fn with_half_open_max_attempts(mut self, max: u32) -> Self {
        self.half_open_max_attempts = max;
        self
    }

    /// Check the configured values.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Config` for a zero threshold, duration or trial limit.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(QueryError::Config(
                "circuit breaker failureThreshold must be greater than zero".to_string(),
            ));
        }
        if self.open_duration.is_zero() {
            return Err(QueryError::Config(
                "circuit breaker openDuration must be greater than zero".to_string(),
            ));
        }
        if self.half_open_max_attempts == 0 {
            return Err(QueryError::Config(
                "circuit breaker halfOpenMaxAttempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawCircuitBreakerConfig {
    failure_threshold: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    open_duration: Duration,
    half_open_max_attempts: u32,
}

impl Default for RawCircuitBreakerConfig {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            open_duration: defaults.open_duration,
            half_open_max_attempts: defaults.half_open_max_attempts,
        }
    }
}

impl TryFrom<RawCircuitBreakerConfig> for CircuitBreakerConfig {
    type Error = QueryError;

    fn try_from(raw: RawCircuitBreakerConfig) -> Result<Self> {
        let config = CircuitBreakerConfig {
            failure_threshold: raw.failure_threshold,
            open_duration: raw.open_duration,
            half_open_max_attempts: raw.half_open_max_attempts,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    transitioned_at: Instant,
    half_open_in_flight: u32,
    // bumped on every transition; outcomes of permits from older generations are ignored
    generation: u64,
}

/// Circuit breaker for protecting the query backend.
///
/// All bookkeeping happens in short critical sections behind one mutex, so
/// concurrent callers observe a single serialized sequence of decisions. The
/// lock is never held across an await point.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Config` if the configuration is invalid.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_valid(config))
    }

    /// Create a circuit breaker with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::from_valid(CircuitBreakerConfig::default())
    }

    fn from_valid(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                transitioned_at: Instant::now(),
                half_open_in_flight: 0,
                generation: 0,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply the lazy Open to Half-Open transition once the cooldown elapsed.
    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state == CircuitState::Open
            && now.saturating_duration_since(inner.transitioned_at) >= self.config.open_duration
        {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_in_flight = 0;
            inner.generation += 1;
            inner.transitioned_at = now;
            info!(
                circuit_breaker.failure_count = inner.failures,
                "circuit breaker half-open, admitting trial calls"
            );
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.half_open_in_flight = 0;
        inner.generation += 1;
        inner.transitioned_at = now;
        warn!(
            circuit_breaker.failure_count = inner.failures,
            open_duration_ms = self.config.open_duration.as_millis() as u64,
            "circuit breaker opened"
        );
    }

    fn close(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.half_open_in_flight = 0;
        inner.generation += 1;
        inner.transitioned_at = now;
        info!("circuit breaker closed, backend recovered");
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Get the current consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Get state and failure count in one consistent read.
    pub fn status(&self) -> BreakerStatus {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        BreakerStatus {
            state: inner.state,
            failure_count: inner.failures,
        }
    }

    /// Number of trial calls currently admitted in half-open state.
    #[must_use]
    pub fn half_open_in_flight(&self) -> u32 {
        self.lock().half_open_in_flight
    }

    /// Ask for admission of one call.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::CircuitOpen` while the circuit is open or all
    /// half-open trial slots are taken.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(CircuitPermit::new(self, inner.generation, false)),
            CircuitState::Open => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                let remaining = self
                    .config
                    .open_duration
                    .saturating_sub(now.saturating_duration_since(inner.transitioned_at));
                Err(QueryError::CircuitOpen(format!(
                    "circuit breaker is open, will retry after {remaining:?}"
                )))
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_attempts {
                    inner.half_open_in_flight += 1;
                    Ok(CircuitPermit::new(self, inner.generation, true))
                } else {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    Err(QueryError::CircuitOpen(format!(
                        "circuit breaker is open, {} half-open trial call(s) in flight",
                        inner.half_open_in_flight
                    )))
                }
            }
        }
    }

    /// Execute an async operation with circuit breaker protection.
    ///
    /// A `QueryError::Cancelled` result releases the admission without
    /// counting as a backend failure.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::CircuitOpen` if the call is rejected, otherwise
    /// the operation's own error.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;

        let result = operation().await;
        match &result {
            Ok(_) => permit.record_success(),
            Err(e) if matches!(e.root(), QueryError::Cancelled(_)) => drop(permit),
            Err(_) => permit.record_failure(),
        }
        result
    }

    fn on_success(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => self.close(&mut inner, Instant::now()),
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, generation: u64) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    self.open(&mut inner, Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                // a failed trial reopens with a fresh cooldown
                inner.failures += 1;
                self.open(&mut inner, Instant::now());
            }
            CircuitState::Open => {}
        }
    }

    fn on_abandoned(&self, generation: u64, trial: bool) {
        let mut inner = self.lock();
        if trial && inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.close(&mut inner, Instant::now());
    }

    /// Get the time until the circuit admits trial calls (if open).
    pub fn time_until_retry(&self) -> Option<Duration> {
        let inner = self.lock();
        if inner.state != CircuitState::Open {
            return None;
        }
        Some(
            self.config
                .open_duration
                .saturating_sub(inner.transitioned_at.elapsed()),
        )
    }

    /// Get total number of admission requests.
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Get total number of recorded failures.
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Get total number of rejections.
    #[must_use]
    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 to 1.0).
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.total_calls.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let failures = self.total_failures.load(Ordering::Relaxed);
        failures as f64 / total as f64
    }

    /// Get the circuit breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Settle it with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping it unsettled releases a
/// half-open trial slot without recording an outcome.
#[must_use = "an unsettled permit records no outcome"]
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl<'a> CircuitPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64, trial: bool) -> Self {
        Self {
            breaker,
            generation,
            trial,
            settled: false,
        }
    }

    /// Whether this call was admitted as a half-open trial.
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.generation, self.trial);
        }
    }
}

/// `QueryClient` layer that guards the inner client with a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerClient<C> {
    inner: C,
    breaker: Arc<CircuitBreaker>,
}

impl<C: QueryClient> CircuitBreakerClient<C> {
    pub fn new(inner: C, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    /// Build the layer with a fresh breaker.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Config` if the configuration is invalid.
    pub fn with_config(inner: C, config: CircuitBreakerConfig) -> Result<Self> {
        Ok(Self::new(inner, Arc::new(CircuitBreaker::new(config)?)))
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: QueryClient> QueryClient for CircuitBreakerClient<C> {
    async fn query_with_options(&self, query: &str, options: &QueryOptions) -> Result<QueryResult> {
        self.breaker
            .call(|| self.inner.query_with_options(query, options))
            .await
    }

    async fn event_types(&self, filter: &EventTypeFilter) -> Result<Vec<String>> {
        self.breaker.call(|| self.inner.event_types(filter)).await
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        self.breaker.call(|| self.inner.accounts()).await
    }

    fn breaker_status(&self) -> Option<BreakerStatus> {
        Some(self.breaker.status())
    }
}
