// SPDX-License-Identifier: MIT OR Apache-2.0

//! Completion logging for query client calls.
//!
//! Emits one structured `tracing` event per call with timing, outcome and
//! error category. Installing a subscriber is left to the application.
//!
//! # Example
//!
//! ```
//! use telemetry_query_rs::runtime::{LogLevel, LoggingConfig};
//!
//! let config = LoggingConfig::new()
//!     .with_success_level(LogLevel::Debug)
//!     .with_query_text(true)
//!     .with_max_query_chars(200);
//! assert_eq!(config.success_level, LogLevel::Debug);
//! ```

use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::error::QueryError;
use crate::runtime::tracing::{truncate_query, Operation};

/// Target of every completion event.
pub const LOG_TARGET: &str = "telemetry_query::client";

/// Log level for completion events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Trace level - most verbose.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warn level.
    Warn,
    /// Error level - only errors.
    Error,
    /// Disabled - no logging.
    Off,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Off => write!(f, "OFF"),
        }
    }
}

/// Configuration for completion logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level for successful calls.
    pub success_level: LogLevel,
    /// Log level for failed calls.
    pub error_level: LogLevel,
    /// Whether to include the query text.
    pub log_query_text: bool,
    /// Longest query text included, in characters.
    pub max_query_chars: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            success_level: LogLevel::Debug,
            error_level: LogLevel::Warn,
            log_query_text: false,
            max_query_chars: 200,
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the success log level.
    #[must_use]
    pub fn with_success_level(mut self, level: LogLevel) -> Self {
        self.success_level = level;
        self
    }

    /// Set the error log level.
    #[must_use]
    pub fn with_error_level(mut self, level: LogLevel) -> Self {
        self.error_level = level;
        self
    }

    /// Enable or disable query text logging.
    #[must_use]
    pub fn with_query_text(mut self, enabled: bool) -> Self {
        self.log_query_text = enabled;
        self
    }

    /// Set the longest query text included.
    #[must_use]
    pub fn with_max_query_chars(mut self, max: usize) -> Self {
        self.max_query_chars = max;
        self
    }

    /// Create a verbose configuration for debugging.
    #[must_use]
    pub fn verbose() -> Self {
        Self {
            success_level: LogLevel::Info,
            error_level: LogLevel::Error,
            log_query_text: true,
            max_query_chars: 500,
        }
    }

    /// Create a quiet configuration for production.
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            success_level: LogLevel::Off,
            error_level: LogLevel::Warn,
            log_query_text: false,
            max_query_chars: 200,
        }
    }
}

macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            LogLevel::Trace => trace!(target: LOG_TARGET, $($arg)+),
            LogLevel::Debug => debug!(target: LOG_TARGET, $($arg)+),
            LogLevel::Info => info!(target: LOG_TARGET, $($arg)+),
            LogLevel::Warn => warn!(target: LOG_TARGET, $($arg)+),
            LogLevel::Error => error!(target: LOG_TARGET, $($arg)+),
            LogLevel::Off => {}
        }
    };
}

/// Emits one event per finished call.
#[derive(Debug, Clone, Default)]
pub struct QueryLogger {
    config: LoggingConfig,
}

impl QueryLogger {
    /// Create a query logger with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a query logger with custom configuration.
    #[must_use]
    pub fn with_config(config: LoggingConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }

    fn query_text(&self, query: Option<&str>) -> String {
        match query {
            Some(query) if self.config.log_query_text => {
                truncate_query(query, self.config.max_query_chars).into_owned()
            }
            _ => String::new(),
        }
    }

    /// Log a successful call.
    pub fn log_success(
        &self,
        operation: Operation,
        query: Option<&str>,
        elapsed: Duration,
        result_count: usize,
    ) {
        if self.config.success_level == LogLevel::Off {
            return;
        }
        let query = self.query_text(query);
        log_at!(
            self.config.success_level,
            operation = %operation,
            query = %query,
            duration_ms = elapsed.as_millis() as u64,
            result.count = result_count as u64,
            "{operation} completed in {elapsed:?}"
        );
    }

    /// Log a failed call.
    pub fn log_failure(
        &self,
        operation: Operation,
        query: Option<&str>,
        elapsed: Duration,
        err: &QueryError,
    ) {
        if self.config.error_level == LogLevel::Off {
            return;
        }
        let query = self.query_text(query);
        let category = err.category();
        log_at!(
            self.config.error_level,
            operation = %operation,
            query = %query,
            duration_ms = elapsed.as_millis() as u64,
            attempts = err.attempts(),
            error.type = %category,
            "{operation} failed in {elapsed:?}: {err}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Trace.to_string(), "TRACE");
        assert_eq!(LogLevel::Debug.to_string(), "DEBUG");
        assert_eq!(LogLevel::Info.to_string(), "INFO");
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
        assert_eq!(LogLevel::Off.to_string(), "OFF");
    }

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.success_level, LogLevel::Debug);
        assert_eq!(config.error_level, LogLevel::Warn);
        assert!(!config.log_query_text);
    }

    #[test]
    fn test_logging_config_builder() {
        let config = LoggingConfig::new()
            .with_success_level(LogLevel::Trace)
            .with_error_level(LogLevel::Error)
            .with_query_text(true)
            .with_max_query_chars(10);

        assert_eq!(config.success_level, LogLevel::Trace);
        assert_eq!(config.error_level, LogLevel::Error);
        assert!(config.log_query_text);
        assert_eq!(config.max_query_chars, 10);
    }

    #[test]
    fn test_logging_config_presets() {
        let verbose = LoggingConfig::verbose();
        assert_eq!(verbose.success_level, LogLevel::Info);
        assert!(verbose.log_query_text);

        let quiet = LoggingConfig::quiet();
        assert_eq!(quiet.success_level, LogLevel::Off);
        assert_eq!(quiet.error_level, LogLevel::Warn);
        assert!(!quiet.log_query_text);
    }

    #[test]
    fn test_query_text_respects_config() {
        let hidden = QueryLogger::new();
        assert_eq!(hidden.query_text(Some("SELECT 1")), "");

        let shown = QueryLogger::with_config(
            LoggingConfig::new()
                .with_query_text(true)
                .with_max_query_chars(6),
        );
        assert_eq!(shown.query_text(Some("SELECT count(*)")), "SELECT...");
        assert_eq!(shown.query_text(None), "");
    }

    #[test]
    fn test_logger_without_subscriber() {
        let logger = QueryLogger::with_config(LoggingConfig::verbose());
        logger.log_success(Operation::Query, Some("SELECT 1"), Duration::from_millis(3), 1);
        logger.log_failure(
            Operation::Accounts,
            None,
            Duration::from_millis(3),
            &QueryError::Unauthorized("bad key".to_string()),
        );
        // Should not panic
    }
}
