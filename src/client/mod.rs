// SPDX-License-Identifier: MIT OR Apache-2.0

//! The query client capability and its data types.
//!
//! Every layer of the resilient chain implements [`QueryClient`] and holds the
//! next layer by value, so layers nest transparently:
//!
//! ```text
//! InstrumentedClient -> CircuitBreakerClient -> RetryClient -> BaseClient -> QueryTransport
//! ```

mod base;
mod builder;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::runtime::BreakerStatus;

pub use base::{BaseClient, QueryTransport, DEFAULT_EVENT_TYPES_SINCE};
pub use builder::{QueryClientBuilder, ResilientClient};

/// One result row, column name to value.
pub type Row = Map<String, Value>;

/// Per-call options. Unset fields fall back to the base client's defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub account_id: Option<String>,
    /// Total budget for the call, across all retry attempts and backoff sleeps.
    pub timeout: Option<Duration>,
    pub result_limit: Option<u32>,
    pub cancellation: Option<CancellationToken>,
}

impl QueryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_result_limit(mut self, limit: u32) -> Self {
        self.result_limit = Some(limit);
        self
    }

    /// Cancel the call (including any pending backoff) when `token` fires.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Rows and metadata returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl QueryResult {
    #[must_use]
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of facets, from a `facets` array or a numeric `facetCount`.
    pub fn facet_count(&self) -> Option<u64> {
        match self.metadata.get("facets") {
            Some(Value::Array(facets)) => Some(facets.len() as u64),
            _ => self.metadata.get("facetCount").and_then(Value::as_u64),
        }
    }

    /// Total matching count, from `totalCount` or `total_count`.
    pub fn total_count(&self) -> Option<u64> {
        self.metadata
            .get("totalCount")
            .or_else(|| self.metadata.get("total_count"))
            .and_then(Value::as_u64)
    }
}

/// An account visible to the configured credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub name: String,
}

/// Filter for [`QueryClient::event_types`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTypeFilter {
    /// Lookback window, e.g. `1 day ago`. Defaults to `1 week ago`.
    pub since: Option<String>,
    /// Case-insensitive substring the event type name must contain.
    pub name_contains: Option<String>,
}

impl EventTypeFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn since(mut self, since: impl Into<String>) -> Self {
        self.since = Some(since.into());
        self
    }

    #[must_use]
    pub fn name_contains(mut self, needle: impl Into<String>) -> Self {
        self.name_contains = Some(needle.into());
        self
    }

    /// Whether `name` passes the name filter.
    pub fn matches(&self, name: &str) -> bool {
        match &self.name_contains {
            Some(needle) => name.to_lowercase().contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

/// Execute queries against the telemetry backend.
#[async_trait]
pub trait QueryClient: Send + Sync {
    /// Run a query with default options.
    async fn query(&self, query: &str) -> Result<QueryResult> {
        self.query_with_options(query, &QueryOptions::default())
            .await
    }

    async fn query_with_options(&self, query: &str, options: &QueryOptions) -> Result<QueryResult>;

    /// Names of the event types reported within the filter's window.
    async fn event_types(&self, filter: &EventTypeFilter) -> Result<Vec<String>>;

    async fn accounts(&self) -> Result<Vec<Account>>;

    /// Live breaker state, if a circuit breaker guards this client.
    fn breaker_status(&self) -> Option<BreakerStatus> {
        None
    }
}

#[async_trait]
impl<C: QueryClient + ?Sized> QueryClient for Arc<C> {
    async fn query(&self, query: &str) -> Result<QueryResult> {
        (**self).query(query).await
    }

    async fn query_with_options(&self, query: &str, options: &QueryOptions) -> Result<QueryResult> {
        (**self).query_with_options(query, options).await
    }

    async fn event_types(&self, filter: &EventTypeFilter) -> Result<Vec<String>> {
        (**self).event_types(filter).await
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        (**self).accounts().await
    }

    fn breaker_status(&self) -> Option<BreakerStatus> {
        (**self).breaker_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_options_builder() {
        let options = QueryOptions::new()
            .with_account_id("1234")
            .with_timeout(Duration::from_secs(5))
            .with_result_limit(100);

        assert_eq!(options.account_id.as_deref(), Some("1234"));
        assert_eq!(options.timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.result_limit, Some(100));
        assert!(options.cancellation.is_none());
    }

    #[test]
    fn test_facet_and_total_counts() {
        let result = QueryResult::default()
            .with_metadata("facets", json!(["a", "b", "c"]))
            .with_metadata("totalCount", json!(42));
        assert_eq!(result.facet_count(), Some(3));
        assert_eq!(result.total_count(), Some(42));

        let result = QueryResult::default().with_metadata("facetCount", json!(7));
        assert_eq!(result.facet_count(), Some(7));
        assert_eq!(result.total_count(), None);
    }

    #[test]
    fn test_query_result_deserializes_with_missing_fields() {
        let result: QueryResult = serde_json::from_value(json!({
            "rows": [{"count": 12}]
        }))
        .unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.metadata.is_empty());
    }

    #[test]
    fn test_event_type_filter_matches() {
        let filter = EventTypeFilter::new().name_contains("trans");
        assert!(filter.matches("Transaction"));
        assert!(filter.matches("TransactionError"));
        assert!(!filter.matches("PageView"));
        assert!(EventTypeFilter::new().matches("anything"));
    }
}
