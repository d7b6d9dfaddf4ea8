// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test support: a scripted in-memory backend.
//!
//! [`MockTransport`] answers `execute` calls from a queue of scripted
//! outcomes and falls back to a fixed outcome once the queue is empty. Clones
//! share the same script and counters, so a test can keep one handle while the
//! client under test owns another.
//!
//! ```
//! use telemetry_query_rs::client::{BaseClient, QueryClient};
//! use telemetry_query_rs::error::QueryError;
//! use telemetry_query_rs::testkit::MockTransport;
//!
//! # tokio_test::block_on(async {
//! let transport = MockTransport::new();
//! transport.push_err(QueryError::Connection("refused".to_string()));
//!
//! let client = BaseClient::new(transport.clone());
//! assert!(client.query("SELECT 1").await.is_err());
//! assert!(client.query("SELECT 1").await.is_ok());
//! assert_eq!(transport.calls(), 2);
//! # });
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::client::{Account, QueryOptions, QueryResult, QueryTransport, Row};
use crate::error::Result;

/// Build a result row from a JSON object. Non-object values land under `value`.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Row::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[derive(Debug)]
struct Script {
    outcomes: VecDeque<Result<QueryResult>>,
    fallback: Result<QueryResult>,
    queries: Vec<String>,
    options: Vec<QueryOptions>,
}

#[derive(Debug)]
struct Shared {
    script: Mutex<Script>,
    accounts: Vec<Account>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    account_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Scripted [`QueryTransport`] for tests.
#[derive(Debug, Clone)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A transport that answers every query with an empty result.
    pub fn new() -> Self {
        Self::build(Vec::new(), None)
    }

    fn build(accounts: Vec<Account>, latency: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                script: Mutex::new(Script {
                    outcomes: VecDeque::new(),
                    fallback: Ok(QueryResult::default()),
                    queries: Vec::new(),
                    options: Vec::new(),
                }),
                accounts,
                latency,
                calls: AtomicUsize::new(0),
                account_calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Delay every response by `latency` (on the tokio clock).
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        let accounts = self.shared.accounts.clone();
        let fresh = Self::build(accounts, Some(latency));
        fresh.adopt_script(&self);
        fresh
    }

    /// Answer `list_accounts` with `accounts`.
    #[must_use]
    pub fn with_accounts(self, accounts: Vec<Account>) -> Self {
        let fresh = Self::build(accounts, self.shared.latency);
        fresh.adopt_script(&self);
        fresh
    }

    fn adopt_script(&self, other: &MockTransport) {
        let mut theirs = other.script();
        let mut ours = self.script();
        ours.outcomes = std::mem::take(&mut theirs.outcomes);
        ours.fallback = theirs.fallback.clone();
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.shared
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a successful response.
    pub fn push_ok(&self, result: QueryResult) {
        self.script().outcomes.push_back(Ok(result));
    }

    /// Queue a failed response.
    pub fn push_err(&self, err: crate::error::QueryError) {
        self.script().outcomes.push_back(Err(err));
    }

    /// Outcome returned once the queue is empty.
    pub fn set_fallback(&self, outcome: Result<QueryResult>) {
        self.script().fallback = outcome;
    }

    /// Number of `execute` calls made so far.
    pub fn calls(&self) -> usize {
        self.shared.calls.load(Ordering::SeqCst)
    }

    pub fn account_calls(&self) -> usize {
        self.shared.account_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `execute` calls that were running at once.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    /// Query texts received, in order.
    pub fn seen_queries(&self) -> Vec<String> {
        self.script().queries.clone()
    }

    /// Options received, in order.
    pub fn seen_options(&self) -> Vec<QueryOptions> {
        self.script().options.clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueryTransport for MockTransport {
    async fn execute(&self, query: &str, options: &QueryOptions) -> Result<QueryResult> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared
            .max_in_flight
            .fetch_max(running, Ordering::SeqCst);
        let _in_flight = InFlight(&self.shared.in_flight);

        let outcome = {
            let mut script = self.script();
            script.queries.push(query.to_string());
            script.options.push(options.clone());
            match script.outcomes.pop_front() {
                Some(outcome) => outcome,
                None => script.fallback.clone(),
            }
        };

        if let Some(latency) = self.shared.latency {
            tokio::time::sleep(latency).await;
        }
        outcome
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.shared.account_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.shared.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(self.shared.accounts.clone())
    }
}
