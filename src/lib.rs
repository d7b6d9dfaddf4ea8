// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resilient, instrumented async client for remote telemetry query backends.
//!
//! Calls flow through a fixed chain of layers, each implementing
//! [`QueryClient`]:
//!
//! 1. [`InstrumentedClient`](runtime::InstrumentedClient) opens a span per call
//!    and records outcome, breaker state, metrics and a log line.
//! 2. [`CircuitBreakerClient`](runtime::CircuitBreakerClient) admits or rejects
//!    the call.
//! 3. [`RetryClient`](runtime::RetryClient) retries transient failures with
//!    exponential backoff under the caller's deadline.
//! 4. [`BaseClient`] validates input and calls the [`QueryTransport`](client::QueryTransport).
//!
//! Use [`QueryClientBuilder`] to assemble the chain.

pub mod client;
pub mod config;
pub mod error;
pub mod runtime;
pub mod testkit;

pub use client::{BaseClient, QueryClient, QueryClientBuilder, QueryOptions, QueryResult};
pub use config::QueryClientConfig;
pub use error::QueryError;
pub use runtime::ErrorCategory;
