// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration management for query clients
//!
//! This module loads the client configuration file: backend endpoint, default
//! account and timeout, and the circuit breaker and retry settings.
//!
//! # Environment Variables
//!
//! The following environment variables are supported:
//!
//! - `TELEMETRY_QUERY_CONFIG` - Path to the config file (default: `<config dir>/telemetry-query/config.yaml`)
//! - `TELEMETRY_QUERY_ACCOUNT_ID` - Override the default account
//! - `TELEMETRY_QUERY_ENDPOINT` - Override the endpoint
//! - `TELEMETRY_QUERY_TIMEOUT` - Override the default timeout (e.g. `30s`)
//!
//! # Example
//!
//! ```no_run
//! use telemetry_query_rs::config::QueryClientConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load with environment variable overrides
//! let config = QueryClientConfig::load_with_env()?;
//!
//! if let Some(endpoint) = &config.endpoint {
//!     println!("Querying {endpoint}");
//! }
//! # Ok(())
//! # }
//! ```

mod query_config;

pub(crate) use query_config::deserialize_duration;
pub use query_config::{
    QueryClientConfig, ENV_ACCOUNT_ID, ENV_CONFIG_PATH, ENV_ENDPOINT, ENV_TIMEOUT,
};
