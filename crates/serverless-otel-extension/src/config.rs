//! Configuration loading and management.
//!
//! This module provides layered configuration for the extension using figment.
//! Configuration is loaded from (in order of priority):
//! 1. Default values (compiled in)
//! 2. Config file: `/var/task/sls-otel-extension.toml` (optional)
//! 3. Well-known Lambda and Serverless environment variables
//! 4. Extension-specific environment variables (`SLS_OTEL_EXTENSION_*`)
//!
//! # Supported Well-Known Environment Variables
//!
//! | Variable | Config Path | Description |
//! |----------|-------------|-------------|
//! | `AWS_LAMBDA_RUNTIME_API` | `extension.runtime_api` | Host and port of the Runtime API |
//! | `SLS_OTEL_SERVER_HOST` | `telemetry_listener.host` | Telemetry relay bind host |
//! | `SLS_OTEL_SERVER_PORT` | `telemetry_listener.port` | Telemetry relay bind port |
//! | `SLS_LOG_SERVER_HOST` | `log_listener.host` | Log listener bind host |
//! | `SLS_LOG_SERVER_PORT` | `log_listener.port` | Log listener bind port |
//!
//! Extension-specific variables use `__` to separate nested keys, for example
//! `SLS_OTEL_EXTENSION_COLLECTOR__ENDPOINT`, and take precedence.

use crate::extensions_api::LogType;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/var/task/sls-otel-extension.toml";
const ENV_PREFIX: &str = "SLS_OTEL_EXTENSION_";

/// Default name the extension registers under.
pub const DEFAULT_EXTENSION_NAME: &str = "serverless-otel-extension";

/// Main configuration struct for the extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Extensions API settings.
    pub extension: ExtensionConfig,
    /// Listener receiving telemetry from the instrumented function.
    pub telemetry_listener: ListenerConfig,
    /// Listener receiving Logs API batches.
    pub log_listener: ListenerConfig,
    /// Downstream collector settings.
    pub collector: CollectorConfig,
    /// Logs API subscription settings.
    pub logs_api: LogsApiConfig,
}

impl Config {
    /// Loads configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    #[allow(clippy::result_large_err)]
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration from a custom config file path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    #[allow(clippy::result_large_err)]
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if config_path.as_ref().exists() {
            figment = figment.merge(Toml::file(config_path));
        }

        figment = figment.merge(well_known_env());
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment.extract()
    }

    /// Creates a new config builder for testing.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Extensions API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    /// Name sent in the `Lambda-Extension-Name` header.
    pub name: String,
    /// Runtime API authority (`host:port`), normally from `AWS_LAMBDA_RUNTIME_API`.
    pub runtime_api: Option<String>,
    /// Timeout for the next-event long poll in milliseconds.
    #[serde(with = "duration_ms")]
    pub next_event_timeout: Duration,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_EXTENSION_NAME.to_string(),
            runtime_api: None,
            next_event_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Local HTTP listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host or address to bind.
    pub host: String,
    /// Port to bind. Zero picks an ephemeral port.
    pub port: u16,
    /// Maximum number of pending connections in the accept queue.
    pub backlog: u32,
}

impl ListenerConfig {
    /// Creates a listener configuration for `host:port` with the default backlog.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Default configuration of the telemetry relay listener.
    pub fn telemetry_default() -> Self {
        Self::new("127.0.0.1", 2772)
    }

    /// Default configuration of the Logs API listener.
    pub fn log_default() -> Self {
        Self::new("0.0.0.0", 2773)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            backlog: 64,
        }
    }
}

/// Downstream collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Base URL that records are posted to as `{endpoint}/{recordType}`.
    pub endpoint: Option<String>,
    /// Request timeout in milliseconds.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Logs API subscription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsApiConfig {
    /// Subscription schema version.
    pub schema_version: String,
    /// Log streams to subscribe to.
    pub types: Vec<LogType>,
    /// Maximum number of records buffered before delivery.
    pub max_items: u32,
    /// Maximum size in bytes buffered before delivery.
    pub max_bytes: u32,
    /// Maximum time in milliseconds buffered before delivery.
    pub timeout_ms: u32,
}

impl Default for LogsApiConfig {
    fn default() -> Self {
        Self {
            schema_version: "2021-03-18".to_string(),
            types: vec![LogType::Platform, LogType::Extension, LogType::Function],
            max_items: 1000,
            max_bytes: 256 * 1024,
            timeout_ms: 100,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            extension: ExtensionConfig::default(),
            telemetry_listener: ListenerConfig::telemetry_default(),
            log_listener: ListenerConfig::log_default(),
            collector: CollectorConfig::default(),
            logs_api: LogsApiConfig::default(),
        }
    }
}

/// Builder for constructing configuration programmatically.
#[must_use = "builders do nothing unless .build() is called"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new config builder with default values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Sets the extension name.
    pub fn extension_name(mut self, name: impl Into<String>) -> Self {
        self.config.extension.name = name.into();
        self
    }

    /// Sets the Runtime API authority (`host:port`).
    pub fn runtime_api(mut self, runtime_api: impl Into<String>) -> Self {
        self.config.extension.runtime_api = Some(runtime_api.into());
        self
    }

    /// Sets the next-event long poll timeout.
    pub fn next_event_timeout(mut self, timeout: Duration) -> Self {
        self.config.extension.next_event_timeout = timeout;
        self
    }

    /// Sets the telemetry relay listener.
    pub fn telemetry_listener(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.telemetry_listener.host = host.into();
        self.config.telemetry_listener.port = port;
        self
    }

    /// Sets the Logs API listener.
    pub fn log_listener(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.log_listener.host = host.into();
        self.config.log_listener.port = port;
        self
    }

    /// Sets the collector endpoint.
    pub fn collector_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.collector.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the collector request timeout.
    pub fn collector_timeout(mut self, timeout: Duration) -> Self {
        self.config.collector.timeout = timeout;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Serialize)]
struct PartialExtensionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime_api: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct PartialListenerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
}

impl PartialListenerConfig {
    fn is_empty(&self) -> bool {
        self.host.is_none() && self.port.is_none()
    }

    fn from_env(host_var: &str, port_var: &str) -> Self {
        let host = std::env::var(host_var).ok().filter(|h| !h.is_empty());
        let port = std::env::var(port_var)
            .ok()
            .filter(|p| !p.is_empty())
            .and_then(|p| match p.parse::<u16>() {
                Ok(port) => Some(port),
                Err(e) => {
                    tracing::warn!(variable = port_var, value = %p, error = %e, "Ignoring invalid port");
                    None
                }
            });

        Self { host, port }
    }
}

/// Partial config for well-known env var overrides.
#[derive(Debug, Default, Serialize)]
struct PartialConfig {
    #[serde(skip_serializing_if = "is_partial_extension_empty")]
    extension: PartialExtensionConfig,
    #[serde(skip_serializing_if = "PartialListenerConfig::is_empty")]
    telemetry_listener: PartialListenerConfig,
    #[serde(skip_serializing_if = "PartialListenerConfig::is_empty")]
    log_listener: PartialListenerConfig,
}

fn is_partial_extension_empty(config: &PartialExtensionConfig) -> bool {
    config.runtime_api.is_none()
}

fn well_known_env() -> Serialized<PartialConfig> {
    let config = PartialConfig {
        extension: PartialExtensionConfig {
            runtime_api: std::env::var("AWS_LAMBDA_RUNTIME_API")
                .ok()
                .filter(|api| !api.is_empty()),
        },
        telemetry_listener: PartialListenerConfig::from_env(
            "SLS_OTEL_SERVER_HOST",
            "SLS_OTEL_SERVER_PORT",
        ),
        log_listener: PartialListenerConfig::from_env("SLS_LOG_SERVER_HOST", "SLS_LOG_SERVER_PORT"),
    };

    Serialized::defaults(config)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
