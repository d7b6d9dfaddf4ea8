// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::client::{Account, EventTypeFilter, QueryClient, QueryOptions, QueryResult};
use crate::config::QueryClientConfig;
use crate::error::{QueryError, Result};

/// Window used by [`QueryClient::event_types`] when the filter sets none.
pub const DEFAULT_EVENT_TYPES_SINCE: &str = "1 week ago";

/// The wire-level backend connection.
///
/// Implementations perform exactly one request per call and report failures
/// with the most structured `QueryError` variant they can, e.g.
/// [`QueryError::Http`] with the response status.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn execute(&self, query: &str, options: &QueryOptions) -> Result<QueryResult>;

    async fn list_accounts(&self) -> Result<Vec<Account>>;
}

#[async_trait]
impl<T: QueryTransport + ?Sized> QueryTransport for Arc<T> {
    async fn execute(&self, query: &str, options: &QueryOptions) -> Result<QueryResult> {
        (**self).execute(query, options).await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        (**self).list_accounts().await
    }
}

/// Innermost `QueryClient`: validates input, applies defaults and calls the transport.
#[derive(Debug, Clone)]
pub struct BaseClient<T> {
    transport: T,
    default_account_id: Option<String>,
    default_timeout: Option<Duration>,
}

impl<T: QueryTransport> BaseClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            default_account_id: None,
            default_timeout: None,
        }
    }

    /// Create a base client using the defaults of a loaded configuration.
    pub fn from_config(transport: T, config: &QueryClientConfig) -> Self {
        Self {
            transport,
            default_account_id: config.account_id.clone(),
            default_timeout: config.default_timeout,
        }
    }

    #[must_use]
    pub fn with_default_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.default_account_id = Some(account_id.into());
        self
    }

    /// Timeout handed to the transport when the caller sets none.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn effective_options(&self, options: &QueryOptions) -> QueryOptions {
        let mut merged = options.clone();
        if merged.account_id.is_none() {
            merged.account_id.clone_from(&self.default_account_id);
        }
        if merged.timeout.is_none() {
            merged.timeout = self.default_timeout;
        }
        merged
    }
}

#[async_trait]
impl<T: QueryTransport> QueryClient for BaseClient<T> {
    async fn query_with_options(&self, query: &str, options: &QueryOptions) -> Result<QueryResult> {
        if query.trim().is_empty() {
            return Err(QueryError::Validation("query must not be empty".to_string()));
        }

        let options = self.effective_options(options);
        self.transport.execute(query, &options).await
    }

    async fn event_types(&self, filter: &EventTypeFilter) -> Result<Vec<String>> {
        let since = filter
            .since
            .as_deref()
            .unwrap_or(DEFAULT_EVENT_TYPES_SINCE);
        let query = format!("SHOW EVENT TYPES SINCE {since}");

        let result = self
            .transport
            .execute(&query, &self.effective_options(&QueryOptions::default()))
            .await?;

        let names: BTreeSet<String> = result
            .rows
            .iter()
            .filter_map(|row| row.get("eventType").and_then(Value::as_str))
            .filter(|name| filter.matches(name))
            .map(str::to_string)
            .collect();

        debug!(count = names.len(), since, "listed event types");
        Ok(names.into_iter().collect())
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        self.transport.list_accounts().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{row, MockTransport};
    use serde_json::json;

    #[tokio::test]
    async fn test_empty_query_rejected_without_network_call() {
        let transport = MockTransport::new();
        let client = BaseClient::new(transport.clone());

        let err = client.query("   ").await.unwrap_err();
        assert!(matches!(err, QueryError::Validation(_)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_defaults_fill_unset_options() {
        let transport = MockTransport::new();
        let client = BaseClient::new(transport.clone())
            .with_default_account_id("1234")
            .with_default_timeout(Duration::from_secs(30));

        client.query("SELECT 1").await.unwrap();
        client
            .query_with_options("SELECT 2", &QueryOptions::new().with_account_id("999"))
            .await
            .unwrap();

        let seen = transport.seen_options();
        assert_eq!(seen[0].account_id.as_deref(), Some("1234"));
        assert_eq!(seen[0].timeout, Some(Duration::from_secs(30)));
        assert_eq!(seen[1].account_id.as_deref(), Some("999"));
    }

    #[tokio::test]
    async fn test_event_types_sorted_unique_and_filtered() {
        let transport = MockTransport::new();
        transport.push_ok(QueryResult::from_rows(vec![
            row(json!({"eventType": "TransactionError"})),
            row(json!({"eventType": "PageView"})),
            row(json!({"eventType": "Transaction"})),
            row(json!({"eventType": "Transaction"})),
            row(json!({"other": 1})),
        ]));
        let client = BaseClient::new(transport.clone());

        let names = client
            .event_types(&EventTypeFilter::new().name_contains("TRANS"))
            .await
            .unwrap();

        assert_eq!(names, vec!["Transaction", "TransactionError"]);
        assert_eq!(
            transport.seen_queries(),
            vec!["SHOW EVENT TYPES SINCE 1 week ago".to_string()]
        );
    }

    #[tokio::test]
    async fn test_event_types_custom_window() {
        let transport = MockTransport::new();
        let client = BaseClient::new(transport.clone());

        client
            .event_types(&EventTypeFilter::new().since("1 day ago"))
            .await
            .unwrap();

        assert_eq!(
            transport.seen_queries(),
            vec!["SHOW EVENT TYPES SINCE 1 day ago".to_string()]
        );
    }

    #[tokio::test]
    async fn test_accounts_delegate_to_transport() {
        let transport = MockTransport::new().with_accounts(vec![Account {
            id: 1,
            name: "prod".to_string(),
        }]);
        let client = BaseClient::new(transport);

        let accounts = client.accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].name, "prod");
    }
}
