//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use bus::{BusConfig, RetryPolicy};
use saga::OrchestratorConfig;

/// Log output format selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Server and saga configuration.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json`
/// - `BUS_URL`: message bus transport (default `memory://local`)
/// - `DATABASE_URL`: Postgres saga log; in-memory when unset
/// - `SAGA_STEP_TIMEOUT_MS`, `SAGA_MAX_ATTEMPTS`, `SAGA_SWEEP_INTERVAL_MS`
/// - `BUS_MAX_DELIVERIES`, `BUS_RETRY_BASE_MS`
/// - `API_TOKENS`: bearer tokens as `token=user_id:Role`, comma separated
///
/// Values that fail to parse fall back to the default, as do zero timeouts
/// and sweep intervals.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub bus_url: String,
    pub database_url: Option<String>,
    pub step_timeout: Duration,
    pub max_attempts: u32,
    pub sweep_interval: Duration,
    pub bus_max_deliveries: u32,
    pub bus_retry_base: Duration,
    pub api_tokens: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parsed(key).map(Duration::from_millis).unwrap_or(default)
        };
        // Timers cannot tick at zero.
        let period = |key: &str, default: Duration| {
            parsed(key)
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .and_then(|f| f.parse().ok())
                .unwrap_or_default(),
            bus_url: lookup("BUS_URL").unwrap_or(defaults.bus_url),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            step_timeout: period("SAGA_STEP_TIMEOUT_MS", defaults.step_timeout),
            max_attempts: parsed("SAGA_MAX_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_attempts),
            sweep_interval: period("SAGA_SWEEP_INTERVAL_MS", defaults.sweep_interval),
            bus_max_deliveries: parsed("BUS_MAX_DELIVERIES")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.bus_max_deliveries),
            bus_retry_base: millis("BUS_RETRY_BASE_MS", defaults.bus_retry_base),
            api_tokens: lookup("API_TOKENS"),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig::in_memory()
            .with_url(self.bus_url.clone())
            .with_max_deliveries(self.bus_max_deliveries)
            .with_redelivery_base(self.bus_retry_base)
    }

    /// Publish retries reuse the bus delivery budget.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.bus_max_deliveries, self.bus_retry_base)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_step_timeout(self.step_timeout)
            .with_max_attempts(self.max_attempts)
            .with_publish_retry(self.retry_policy())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            bus_url: "memory://local".to_string(),
            database_url: None,
            step_timeout: Duration::from_secs(30),
            max_attempts: 3,
            sweep_interval: Duration::from_secs(5),
            bus_max_deliveries: 5,
            bus_retry_base: Duration::from_millis(100),
            api_tokens: None,
        }
    }
}
