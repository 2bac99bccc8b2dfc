// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reporter configuration file parser
//!
//! The configuration is a YAML document (typically
//! `~/.datadog/ci-transport.yaml`). Every field has a default, so an empty
//! document is valid apart from the API key required in `api` mode.
//!
//! # Example
//!
//! ```
//! use datadog_ci_transport::config::{ReportMode, ReporterConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ReporterConfig::from_yaml(
//!     r#"
//! mode: agent
//! agent_host: datadog-agent
//! traces:
//!   compression: false
//! "#,
//! )?;
//!
//! assert_eq!(config.mode, ReportMode::Agent);
//! assert!(config.traces.batching);
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::client::proxy::{EnvProxySource, ProxySettings, ProxySource, StaticProxySource};
use crate::client::TransportConfig;
use crate::error::{ReporterError, Result};
use crate::runtime::{
    CircuitBreakerConfig, LoggingConfig, RetryPolicyFactory, DEFAULT_DELAY_FACTOR, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_MAX_HEALTH_CHECK_DELAY_MILLIS, DEFAULT_MIN_HEALTH_CHECK_DELAY_MILLIS,
};
use crate::sender::SenderKind;

/// Path of the configuration file, overriding the default location.
pub const ENV_CONFIG_PATH: &str = "DATADOG_CI_TRANSPORT_CONFIG";
/// `api` or `agent`.
pub const ENV_REPORT_WITH: &str = "DATADOG_JENKINS_PLUGIN_REPORT_WITH";
pub const ENV_API_URL: &str = "DATADOG_JENKINS_PLUGIN_TARGET_API_URL";
pub const ENV_LOG_INTAKE_URL: &str = "DATADOG_JENKINS_PLUGIN_TARGET_LOG_INTAKE_URL";
pub const ENV_WEBHOOK_INTAKE_URL: &str = "DATADOG_JENKINS_PLUGIN_TARGET_WEBHOOK_INTAKE_URL";
pub const ENV_API_KEY: &str = "DATADOG_JENKINS_PLUGIN_TARGET_API_KEY";
pub const ENV_AGENT_HOST: &str = "DATADOG_JENKINS_PLUGIN_TARGET_HOST";
pub const ENV_TRACE_PORT: &str = "DATADOG_JENKINS_PLUGIN_TARGET_TRACE_COLLECTION_PORT";
pub const ENV_LOG_BATCHING: &str = "DATADOG_JENKINS_PLUGIN_ENABLE_LOG_BATCHING";
pub const ENV_TRACE_BATCHING: &str = "DATADOG_JENKINS_PLUGIN_ENABLE_TRACE_BATCHING";
/// Applies to both tracks.
pub const ENV_COMPRESSION: &str = "DATADOG_JENKINS_PLUGIN_ENABLE_COMPRESSION";

pub const DEFAULT_API_URL: &str = "https://api.datadoghq.com/api/";
pub const DEFAULT_LOGS_INTAKE_URL: &str = "https://http-intake.logs.datadoghq.com/v1/input/";
pub const DEFAULT_WEBHOOK_INTAKE_URL: &str = "https://webhook-intake.datadoghq.com/";
pub const DEFAULT_AGENT_HOST: &str = "localhost";
pub const DEFAULT_AGENT_TRACE_PORT: u16 = 8126;
/// 5 MiB, the intake's uncompressed body limit.
pub const DEFAULT_BATCH_LIMIT_BYTES: usize = 5 * 1024 * 1024;

/// Where payloads are delivered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportMode {
    /// Directly to the Datadog API and intakes.
    #[default]
    Api,
    /// Through a local Datadog Agent.
    Agent,
}

impl FromStr for ReportMode {
    type Err = ReporterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" | "http" | "datadog" => Ok(ReportMode::Api),
            "agent" | "dsd" | "datadog_agent" => Ok(ReportMode::Agent),
            other => Err(ReporterError::Config(format!("Unknown report mode {other:?}"))),
        }
    }
}

impl fmt::Display for ReportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportMode::Api => f.write_str("api"),
            ReportMode::Agent => f.write_str("agent"),
        }
    }
}

/// Retry settings of every request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl RetrySettings {
    #[must_use]
    pub fn factory(&self) -> RetryPolicyFactory {
        RetryPolicyFactory::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
        )
        .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

/// Circuit breaker settings, shared by both tracks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: usize,
    pub min_health_check_delay_ms: u64,
    pub max_health_check_delay_ms: u64,
    pub delay_factor: f64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            min_health_check_delay_ms: DEFAULT_MIN_HEALTH_CHECK_DELAY_MILLIS,
            max_health_check_delay_ms: DEFAULT_MAX_HEALTH_CHECK_DELAY_MILLIS,
            delay_factor: DEFAULT_DELAY_FACTOR,
        }
    }
}

impl CircuitBreakerSettings {
    #[must_use]
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.failure_threshold)
            .with_min_health_check_delay(Duration::from_millis(self.min_health_check_delay_ms))
            .with_max_health_check_delay(Duration::from_millis(self.max_health_check_delay_ms))
            .with_delay_factor(self.delay_factor)
    }
}

/// Per-track sending settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackSettings {
    /// Group items into JSON-array batches; otherwise one request per item.
    pub batching: bool,
    /// Gzip batches. Ignored without batching.
    pub compression: bool,
    /// Upper bound of a batch's uncompressed body.
    pub batch_limit_bytes: usize,
}

impl Default for TrackSettings {
    fn default() -> Self {
        Self {
            batching: true,
            compression: true,
            batch_limit_bytes: DEFAULT_BATCH_LIMIT_BYTES,
        }
    }
}

impl TrackSettings {
    #[must_use]
    pub fn sender_kind(&self) -> SenderKind {
        SenderKind::from_flags(self.batching, self.compression)
    }
}

/// Complete reporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReporterConfig {
    pub mode: ReportMode,
    pub api_url: String,
    pub logs_intake_url: String,
    pub webhook_intake_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub agent_host: String,
    pub agent_trace_port: u16,
    /// Timeout of a single attempt.
    pub request_timeout_ms: u64,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub logs: TrackSettings,
    pub traces: TrackSettings,
    /// Fixed proxy; when absent the proxy environment variables apply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySettings>,
    pub http_logging: LoggingConfig,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            mode: ReportMode::Api,
            api_url: DEFAULT_API_URL.to_string(),
            logs_intake_url: DEFAULT_LOGS_INTAKE_URL.to_string(),
            webhook_intake_url: DEFAULT_WEBHOOK_INTAKE_URL.to_string(),
            api_key: None,
            agent_host: DEFAULT_AGENT_HOST.to_string(),
            agent_trace_port: DEFAULT_AGENT_TRACE_PORT,
            request_timeout_ms: 60_000,
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            logs: TrackSettings::default(),
            traces: TrackSettings::default(),
            proxy: None,
            http_logging: LoggingConfig::default(),
        }
    }
}

impl ReporterConfig {
    /// Load from the configured location, then apply environment overrides.
    ///
    /// A missing file at the default location is not an error; a missing
    /// file named by `DATADOG_CI_TRANSPORT_CONFIG` is.
    pub fn load_with_env() -> Result<Self> {
        let mut config = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => Self::load_from_path(path)?,
            Err(_) => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::load_from_path(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Load from `DATADOG_CI_TRANSPORT_CONFIG` or `~/.datadog/ci-transport.yaml`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed.
    pub fn load_default() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The file is malformed YAML
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ReporterError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
            .map_err(|e| ReporterError::Config(format!("Failed to parse config YAML: {e}")))
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| ReporterError::Config(format!("Failed to serialize config: {e}")))
    }

    /// `~/.datadog/ci-transport.yaml`.
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| ReporterError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".datadog").join("ci-transport.yaml"))
    }

    /// The config file path, respecting `DATADOG_CI_TRANSPORT_CONFIG`.
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
            Ok(PathBuf::from(env_path))
        } else {
            Self::default_path()
        }
    }

    /// Override fields from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Override fields from `lookup`, which returns a variable's value.
    /// Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(mode) = get(ENV_REPORT_WITH) {
            self.mode = mode.parse()?;
        }
        if let Some(url) = get(ENV_API_URL) {
            self.api_url = url;
        }
        if let Some(url) = get(ENV_LOG_INTAKE_URL) {
            self.logs_intake_url = url;
        }
        if let Some(url) = get(ENV_WEBHOOK_INTAKE_URL) {
            self.webhook_intake_url = url;
        }
        if let Some(key) = get(ENV_API_KEY) {
            self.api_key = Some(key);
        }
        if let Some(host) = get(ENV_AGENT_HOST) {
            self.agent_host = host;
        }
        if let Some(port) = get(ENV_TRACE_PORT) {
            self.agent_trace_port = port
                .parse()
                .map_err(|e| ReporterError::Config(format!("Invalid {ENV_TRACE_PORT} {port:?}: {e}")))?;
        }
        if let Some(flag) = get(ENV_LOG_BATCHING) {
            self.logs.batching = parse_flag(ENV_LOG_BATCHING, &flag)?;
        }
        if let Some(flag) = get(ENV_TRACE_BATCHING) {
            self.traces.batching = parse_flag(ENV_TRACE_BATCHING, &flag)?;
        }
        if let Some(flag) = get(ENV_COMPRESSION) {
            let enabled = parse_flag(ENV_COMPRESSION, &flag)?;
            self.logs.compression = enabled;
            self.traces.compression = enabled;
        }
        Ok(())
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            ReportMode::Api => {
                if self.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
                    return Err(ReporterError::Config(
                        "An API key is required to report through the API".to_string(),
                    ));
                }
                check_url("api_url", &self.api_url)?;
                check_url("logs_intake_url", &self.logs_intake_url)?;
                check_url("webhook_intake_url", &self.webhook_intake_url)?;
            }
            ReportMode::Agent => {
                if self.agent_host.trim().is_empty() {
                    return Err(ReporterError::Config("agent_host must not be empty".to_string()));
                }
                if self.agent_trace_port == 0 {
                    return Err(ReporterError::Config("agent_trace_port must not be 0".to_string()));
                }
                check_url("agent_host", &self.agent_url())?;
            }
        }

        if self.request_timeout_ms == 0 {
            return Err(ReporterError::Config("request_timeout_ms must be positive".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ReporterError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if !is_positive_finite(self.retry.multiplier) {
            return Err(ReporterError::Config(
                "retry.multiplier must be a positive finite number".to_string(),
            ));
        }
        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 {
            return Err(ReporterError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if !is_positive_finite(breaker.delay_factor) {
            return Err(ReporterError::Config(
                "circuit_breaker.delay_factor must be a positive finite number".to_string(),
            ));
        }
        if breaker.min_health_check_delay_ms > breaker.max_health_check_delay_ms {
            return Err(ReporterError::Config(
                "circuit_breaker.min_health_check_delay_ms exceeds max_health_check_delay_ms".to_string(),
            ));
        }
        for (name, track) in [("logs", &self.logs), ("traces", &self.traces)] {
            if track.batch_limit_bytes < 2 {
                return Err(ReporterError::Config(format!(
                    "{name}.batch_limit_bytes must be at least 2"
                )));
            }
        }
        Ok(())
    }

    /// Base URL of the local agent.
    #[must_use]
    pub fn agent_url(&self) -> String {
        format!("http://{}:{}", self.agent_host.trim(), self.agent_trace_port)
    }

    /// Transport settings derived from this configuration.
    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::new()
            .with_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_retry(self.retry.factory())
            .with_logging(self.http_logging.clone())
    }

    /// The configured proxy, or the proxy environment when none is set.
    #[must_use]
    pub fn proxy_source(&self) -> Arc<dyn ProxySource> {
        match &self.proxy {
            Some(settings) => Arc::new(StaticProxySource(Some(settings.clone()))),
            None => Arc::new(EnvProxySource),
        }
    }
}

fn is_positive_finite(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ReporterError::Config(format!(
            "Invalid {name} {value:?}, expected true or false"
        ))),
    }
}

fn check_url(field: &str, value: &str) -> Result<()> {
    let url = Url::parse(value)
        .map_err(|e| ReporterError::Config(format!("Invalid {field} {value:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ReporterError::Config(format!(
            "Invalid {field} {value:?}: scheme must be http or https"
        )));
    }
    Ok(())
}
