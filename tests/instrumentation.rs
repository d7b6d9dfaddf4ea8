// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use telemetry_query_rs::client::{
    Account, BaseClient, QueryClient, QueryClientBuilder, QueryOptions, QueryTransport,
};
use telemetry_query_rs::error::{QueryError, Result};
use telemetry_query_rs::runtime::{CircuitBreakerConfig, InstrumentedClient, RetryConfig};
use telemetry_query_rs::testkit::{row, MockTransport};
use telemetry_query_rs::QueryResult;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

// =============================================================================
// Span capture
// =============================================================================

#[derive(Debug, Clone, Default)]
struct CapturedSpan {
    name: String,
    fields: HashMap<String, String>,
    events: Vec<HashMap<String, String>>,
}

impl CapturedSpan {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Default)]
struct Captures {
    open: HashMap<u64, CapturedSpan>,
    closed: Vec<CapturedSpan>,
}

#[derive(Clone, Default)]
struct CaptureLayer {
    captures: Arc<Mutex<Captures>>,
}

impl CaptureLayer {
    fn closed(&self) -> Vec<CapturedSpan> {
        self.captures.lock().unwrap().closed.clone()
    }

    fn closed_named(&self, name: &str) -> Vec<CapturedSpan> {
        self.closed().into_iter().filter(|s| s.name == name).collect()
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, _ctx: Context<'_, S>) {
        let mut span = CapturedSpan {
            name: attrs.metadata().name().to_string(),
            ..CapturedSpan::default()
        };
        attrs.record(&mut FieldVisitor(&mut span.fields));
        self.captures
            .lock()
            .unwrap()
            .open
            .insert(id.into_u64(), span);
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
        let mut captures = self.captures.lock().unwrap();
        if let Some(span) = captures.open.get_mut(&id.into_u64()) {
            values.record(&mut FieldVisitor(&mut span.fields));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let parent = event
            .parent()
            .cloned()
            .or_else(|| ctx.current_span().id().cloned());
        let Some(parent) = parent else {
            return;
        };
        let mut fields = HashMap::new();
        event.record(&mut FieldVisitor(&mut fields));
        let mut captures = self.captures.lock().unwrap();
        if let Some(span) = captures.open.get_mut(&parent.into_u64()) {
            span.events.push(fields);
        }
    }

    fn on_close(&self, id: Id, _ctx: Context<'_, S>) {
        let mut captures = self.captures.lock().unwrap();
        if let Some(span) = captures.open.remove(&id.into_u64()) {
            captures.closed.push(span);
        }
    }
}

fn capture() -> (CaptureLayer, tracing::subscriber::DefaultGuard) {
    let layer = CaptureLayer::default();
    let subscriber = tracing_subscriber::registry().with(layer.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (layer, guard)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_long_query_text_is_truncated_on_span() {
    let (layer, _guard) = capture();
    let client = InstrumentedClient::new(BaseClient::new(MockTransport::new()));
    let query = format!("SELECT * FROM Log WHERE message = '{}'", "x".repeat(562));
    assert_eq!(query.chars().count(), 600);

    client
        .query_with_options(
            &query,
            &QueryOptions::new()
                .with_account_id("12345")
                .with_timeout(Duration::from_secs(5))
                .with_result_limit(100),
        )
        .await
        .unwrap();

    let spans = layer.closed_named("telemetry.query");
    assert_eq!(spans.len(), 1);
    let span = &spans[0];
    let text = span.field("query.text").unwrap();
    assert_eq!(text.chars().count(), 503);
    assert!(text.ends_with("..."));
    assert!(query.starts_with(&text[..500]));
    assert_eq!(span.field("query.length"), Some("600"));
    assert_eq!(span.field("query.account_id"), Some("12345"));
    assert_eq!(span.field("query.timeout_ms"), Some("5000"));
    assert_eq!(span.field("query.result_limit"), Some("100"));
}

#[tokio::test]
async fn test_success_records_result_attributes() {
    let (layer, _guard) = capture();
    let transport = MockTransport::new();
    transport.push_ok(
        QueryResult::from_rows(vec![
            row(serde_json::json!({"appName": "checkout", "count": 10})),
            row(serde_json::json!({"appName": "search", "count": 4})),
        ])
        .with_metadata("facets", serde_json::json!(["appName"]))
        .with_metadata("totalCount", serde_json::json!(14)),
    );
    let client = InstrumentedClient::new(BaseClient::new(transport));

    let result = client
        .query("SELECT count(*) FROM Transaction FACET appName")
        .await
        .unwrap();
    assert_eq!(result.len(), 2);

    let span = &layer.closed_named("telemetry.query")[0];
    assert_eq!(span.field("result.count"), Some("2"));
    assert_eq!(span.field("result.facet_count"), Some("1"));
    assert_eq!(span.field("result.total_count"), Some("14"));
    assert_eq!(span.field("error.type"), Some("none"));
    assert_eq!(span.field("otel.status_code"), Some("OK"));
    assert!(span.field("query.duration_ms").is_some());
    // a bare client has no breaker to report
    assert_eq!(span.field("circuit_breaker.state"), None);
}

#[tokio::test]
async fn test_error_records_category_and_event() {
    let (layer, _guard) = capture();
    let transport = MockTransport::new();
    transport.push_err(QueryError::Unauthorized("invalid api key".to_string()));
    let client = InstrumentedClient::new(BaseClient::new(transport));

    let err = client.query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, QueryError::Unauthorized(_)));

    let span = &layer.closed_named("telemetry.query")[0];
    assert_eq!(span.field("error.type"), Some("auth"));
    assert_eq!(span.field("otel.status_code"), Some("ERROR"));
    assert!(span.field("error.message").unwrap().contains("invalid api key"));
    assert!(span
        .events
        .iter()
        .any(|event| event.get("message").map(String::as_str) == Some("query failed")));
}

#[tokio::test]
async fn test_chain_records_breaker_state_and_rejections() {
    let (layer, _guard) = capture();
    let transport = MockTransport::new();
    transport.set_fallback(Err(QueryError::Connection("connection reset".to_string())));
    let client = QueryClientBuilder::new(BaseClient::new(transport.clone()))
        .circuit_breaker(CircuitBreakerConfig::new().with_failure_threshold(2))
        .retry(RetryConfig::disabled())
        .build()
        .unwrap();

    for _ in 0..3 {
        let _ = client.query("SELECT 1").await;
    }
    assert_eq!(transport.calls(), 2);

    let spans = layer.closed_named("telemetry.query");
    assert_eq!(spans.len(), 3);

    assert_eq!(spans[0].field("circuit_breaker.state"), Some("closed"));
    assert_eq!(spans[0].field("circuit_breaker.failure_count"), Some("0"));
    assert_eq!(spans[0].field("error.type"), Some("network"));

    assert_eq!(spans[1].field("circuit_breaker.state"), Some("closed"));
    assert_eq!(spans[1].field("circuit_breaker.failure_count"), Some("1"));

    assert_eq!(spans[2].field("circuit_breaker.state"), Some("open"));
    assert_eq!(spans[2].field("circuit_breaker.failure_count"), Some("2"));
    assert_eq!(spans[2].field("error.type"), Some("circuit_breaker"));
    assert_eq!(spans[2].field("otel.status_code"), Some("ERROR"));
}

#[tokio::test(start_paused = true)]
async fn test_attempt_count_recorded_on_span() {
    let (layer, _guard) = capture();
    let transport = MockTransport::new();
    transport.push_err(QueryError::RateLimited("slow down".to_string()));
    let client = QueryClientBuilder::new(BaseClient::new(transport))
        .retry(
            RetryConfig::builder()
                .max_attempts(3)
                .base_delay(Duration::from_millis(50))
                .jitter_fraction(0.0)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    client.query("SELECT 1").await.unwrap();

    let span = &layer.closed_named("telemetry.query")[0];
    assert_eq!(span.field("query.attempts"), Some("2"));
    assert_eq!(span.field("error.type"), Some("none"));
}

#[tokio::test]
async fn test_other_operations_get_their_own_spans() {
    let (layer, _guard) = capture();
    let transport = MockTransport::new().with_accounts(vec![Account {
        id: 7,
        name: "staging".to_string(),
    }]);
    let client = InstrumentedClient::new(BaseClient::new(transport));

    let accounts = client.accounts().await.unwrap();
    assert_eq!(accounts.len(), 1);

    let span = &layer.closed_named("telemetry.accounts")[0];
    assert_eq!(span.field("result.count"), Some("1"));
    assert_eq!(span.field("otel.status_code"), Some("OK"));
    assert_eq!(span.field("query.text"), None);
}

#[derive(Debug, Clone)]
struct PanickingTransport;

#[async_trait]
impl QueryTransport for PanickingTransport {
    async fn execute(&self, _query: &str, _options: &QueryOptions) -> Result<QueryResult> {
        panic!("backend driver crashed");
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_panicking_call_still_closes_span_as_failed() {
    let (layer, _guard) = capture();
    let client = Arc::new(InstrumentedClient::new(BaseClient::new(PanickingTransport)));

    let task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.query("SELECT 1").await })
    };
    let joined = task.await;
    assert!(joined.unwrap_err().is_panic());

    let spans = layer.closed_named("telemetry.query");
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].field("error.type"), Some("unknown"));
    assert_eq!(spans[0].field("otel.status_code"), Some("ERROR"));
}
