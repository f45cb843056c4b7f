//! Environment-driven configuration
//!
//! All configuration is read once at startup from `APP_*` environment
//! variables and is immutable afterwards. Handlers receive it through
//! shared state instead of calling `std::env::var` themselves.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by every variable the service recognizes
pub const ENV_PREFIX: &str = "APP_";

/// Default port for the application listener
pub const DEFAULT_PORT: u16 = 8080;

/// Default path for Prometheus scraping
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Default greeting returned by `/`
pub const DEFAULT_GREETING: &str = "Hello, World!";

/// Default bound on in-flight requests during shutdown
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on one database status check
pub const DEFAULT_POSTGRESQL_TIMEOUT: Duration = Duration::from_secs(5);

const PORT: &str = "APP_PORT";
const METRICS_PORT: &str = "APP_METRICS_PORT";
const METRICS_PATH: &str = "APP_METRICS_PATH";
const POSTGRESQL_URL: &str = "APP_POSTGRESQL_DB_CONNECT_STRING";
const GREETING: &str = "APP_GREETING";
const DRAIN_TIMEOUT: &str = "APP_DRAIN_TIMEOUT_SECONDS";
const POSTGRESQL_TIMEOUT: &str = "APP_POSTGRESQL_TIMEOUT_SECONDS";
const BIND_ADDRESS: &str = "APP_BIND_ADDRESS";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key} must be a port number, got {value:?}")]
    InvalidPort { key: &'static str, value: String },

    #[error("{key} must be a whole number of seconds, got {value:?}")]
    InvalidSeconds { key: &'static str, value: String },

    #[error("{key} must be an IP address, got {value:?}")]
    InvalidAddress { key: &'static str, value: String },

    #[error("{key} must start with '/' and contain none of '{{', '}}', '*', got {value:?}")]
    InvalidPath { key: &'static str, value: String },
}

/// Service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Address both listeners bind to
    pub bind_address: IpAddr,
    /// Port of the application listener
    pub port: u16,
    /// Port of the metrics listener (same as `port` means shared listener)
    pub metrics_port: u16,
    /// Path metrics are served at
    pub metrics_path: String,
    /// PostgreSQL connection URL, if one was supplied
    pub postgresql_url: Option<String>,
    /// Text returned by the root handler
    pub greeting: String,
    /// How long in-flight requests may run after shutdown starts
    pub drain_timeout: Duration,
    /// Upper bound on one database status check
    pub postgresql_timeout: Duration,
    /// Every `APP_*` variable present at startup
    app_config: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            metrics_port: DEFAULT_PORT,
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
            postgresql_url: None,
            greeting: DEFAULT_GREETING.to_string(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            postgresql_timeout: DEFAULT_POSTGRESQL_TIMEOUT,
            app_config: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Build configuration from an arbitrary set of variables
    ///
    /// Only `APP_*` keys are considered. Missing keys fall back to defaults;
    /// present keys that fail to parse are errors.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let app_config: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        let get = |key: &str| app_config.get(key).map(String::as_str);

        let port = match get(PORT) {
            Some(v) => parse_port(PORT, v)?,
            None => DEFAULT_PORT,
        };
        let metrics_port = match get(METRICS_PORT) {
            Some(v) => parse_port(METRICS_PORT, v)?,
            None => port,
        };

        let metrics_path = get(METRICS_PATH).unwrap_or(DEFAULT_METRICS_PATH);
        validate_metrics_path(metrics_path)?;
        let metrics_path = metrics_path.to_string();

        let bind_address = match get(BIND_ADDRESS) {
            Some(v) => v.trim().parse().map_err(|_| ConfigError::InvalidAddress {
                key: BIND_ADDRESS,
                value: v.to_string(),
            })?,
            None => IpAddr::from([0, 0, 0, 0]),
        };

        let drain_timeout = match get(DRAIN_TIMEOUT) {
            Some(v) => parse_seconds(DRAIN_TIMEOUT, v)?,
            None => DEFAULT_DRAIN_TIMEOUT,
        };
        let postgresql_timeout = match get(POSTGRESQL_TIMEOUT) {
            Some(v) => parse_seconds(POSTGRESQL_TIMEOUT, v)?,
            None => DEFAULT_POSTGRESQL_TIMEOUT,
        };

        // An empty connection string is the same as none at all
        let postgresql_url = get(POSTGRESQL_URL)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let greeting = get(GREETING).unwrap_or(DEFAULT_GREETING).to_string();

        Ok(Self {
            bind_address,
            port,
            metrics_port,
            metrics_path,
            postgresql_url,
            greeting,
            drain_timeout,
            postgresql_timeout,
            app_config,
        })
    }

    /// Whether metrics share the application listener
    pub fn metrics_shared(&self) -> bool {
        self.metrics_port == self.port
    }

    /// Look up a user-facing configuration option by name
    ///
    /// `user-defined-config` resolves to `APP_USER_DEFINED_CONFIG`.
    pub fn app_value(&self, option: &str) -> Option<&str> {
        self.app_config.get(&env_key(option)).map(String::as_str)
    }

    /// All `APP_*` variables captured at startup
    pub fn app_config(&self) -> &BTreeMap<String, String> {
        &self.app_config
    }

    /// Set a captured `APP_*` variable (builder-style, for embedding and tests)
    pub fn with_app_value(mut self, option: &str, value: impl Into<String>) -> Self {
        self.app_config.insert(env_key(option), value.into());
        self
    }
}

/// Map a configuration option name to its environment variable
///
/// Upper-cases the name and replaces `-` and `.` with `_`, then adds the
/// `APP_` prefix.
pub fn env_key(option: &str) -> String {
    let normalized: String = option
        .chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    format!("{}{}", ENV_PREFIX, normalized)
}

/// Check that a metrics path is a literal absolute route
///
/// Braces and `*` are route parameters to the router, so they are refused.
pub fn validate_metrics_path(path: &str) -> Result<(), ConfigError> {
    if !path.starts_with('/') || path.contains(['{', '}', '*']) {
        return Err(ConfigError::InvalidPath {
            key: METRICS_PATH,
            value: path.to_string(),
        });
    }
    Ok(())
}

fn parse_port(key: &'static str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidPort {
        key,
        value: value.to_string(),
    })
}

fn parse_seconds(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::InvalidSeconds {
            key,
            value: value.to_string(),
        })
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
