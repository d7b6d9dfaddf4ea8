// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use url::Url;

use crate::error::{QueryError, Result};
use crate::runtime::{CircuitBreakerConfig, RetryConfig};

/// Path of the configuration file, overriding the default location.
pub const ENV_CONFIG_PATH: &str = "TELEMETRY_QUERY_CONFIG";
/// Overrides `accountId`.
pub const ENV_ACCOUNT_ID: &str = "TELEMETRY_QUERY_ACCOUNT_ID";
/// Overrides `endpoint`.
pub const ENV_ENDPOINT: &str = "TELEMETRY_QUERY_ENDPOINT";
/// Overrides `defaultTimeout` (same duration syntax as the file).
pub const ENV_TIMEOUT: &str = "TELEMETRY_QUERY_TIMEOUT";

/// Client configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryClientConfig {
    /// Backend endpoint, `http` or `https`.
    pub endpoint: Option<String>,

    /// Account used when a call does not name one.
    #[serde(deserialize_with = "deserialize_account_id")]
    pub account_id: Option<String>,

    /// Timeout handed to the transport when a call sets none.
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub default_timeout: Option<Duration>,

    pub circuit_breaker: CircuitBreakerConfig,

    pub retry: RetryConfig,
}

impl QueryClientConfig {
    /// Load configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The config directory cannot be determined
    /// - The config file cannot be read
    /// - The config file is malformed or invalid
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is malformed YAML or
    /// holds invalid settings.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            QueryError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or the settings are invalid.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| QueryError::Config(format!("Failed to parse config YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration file if present, then apply environment overrides.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file or an override is invalid.
    pub fn load_with_env() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            Self::load_from_path(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides looked up by environment variable name, then revalidate.
    ///
    /// # Errors
    ///
    /// Returns an error if an override value is invalid.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(account_id) = lookup(ENV_ACCOUNT_ID) {
            self.account_id = Some(account_id);
        }
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint = Some(endpoint);
        }
        if let Some(timeout) = lookup(ENV_TIMEOUT) {
            let timeout = parse_duration(&timeout)
                .map_err(|e| QueryError::Config(format!("{ENV_TIMEOUT}: {e}")))?;
            self.default_timeout = Some(timeout);
        }
        self.validate()
    }

    /// Check every setting.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Config` for an endpoint that is not an http(s)
    /// URL, a zero default timeout, or invalid breaker or retry settings.
    pub fn validate(&self) -> Result<()> {
        if let Some(endpoint) = &self.endpoint {
            let url = Url::parse(endpoint)
                .map_err(|e| QueryError::Config(format!("Invalid endpoint {endpoint:?}: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(QueryError::Config(format!(
                    "Endpoint {endpoint:?} must use http or https"
                )));
            }
        }
        if self.default_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(QueryError::Config(
                "defaultTimeout must be greater than zero".to_string(),
            ));
        }
        self.circuit_breaker.validate()?;
        self.retry.clone().validate()?;
        Ok(())
    }

    /// Get the default config file path (`<config dir>/telemetry-query/config.yaml`).
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            QueryError::Config("Could not determine config directory".to_string())
        })?;

        Ok(dir.join("telemetry-query").join("config.yaml"))
    }

    /// Get the path to the config file, respecting `TELEMETRY_QUERY_CONFIG`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined when the
    /// variable is not set
    pub fn config_path() -> Result<PathBuf> {
        match std::env::var(ENV_CONFIG_PATH) {
            Ok(env_path) => Ok(PathBuf::from(env_path)),
            Err(_) => Self::default_path(),
        }
    }
}

/// Parse `100ms`, `30s`, `5m` or a bare number of seconds.
pub(crate) fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let parse = |digits: &str| -> std::result::Result<u64, String> {
        digits
            .trim()
            .parse()
            .map_err(|_| format!("Invalid duration: {s}"))
    };

    if let Some(stripped) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(stripped)?))
    } else if let Some(stripped) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(stripped)?))
    } else if let Some(stripped) = s.strip_suffix('m') {
        let minutes = parse(stripped)?;
        minutes
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Duration out of range: {s}"))
    } else {
        Ok(Duration::from_secs(parse(s)?))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> std::result::Result<Duration, String> {
        match self {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => parse_duration(&text),
        }
    }
}

pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?
        .into_duration()
        .map_err(serde::de::Error::custom)
}

fn deserialize_optional_duration<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawDuration>::deserialize(deserializer)?
        .map(RawDuration::into_duration)
        .transpose()
        .map_err(serde::de::Error::custom)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAccountId {
    Number(u64),
    Text(String),
}

fn deserialize_account_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<RawAccountId>::deserialize(deserializer)?.map(|raw| match raw {
            RawAccountId::Number(id) => id.to_string(),
            RawAccountId::Text(id) => id,
        }),
    )
}
