// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-attempt logging for intake requests.
//!
//! Every HTTP attempt made by the transport goes through a [`RequestLogger`],
//! which times it, logs the outcome at a configurable level and keeps
//! counters. API keys never reach the log output.
//!
//! # Example
//!
//! ```
//! use datadog_ci_transport::runtime::{LogLevel, LoggingConfig, RequestLogger};
//!
//! let logger = RequestLogger::with_config(LoggingConfig::new().with_success_level(LogLevel::Info));
//! let span = logger.start("POST", "https://http-intake.logs.datadoghq.com/v1/input");
//! logger.finish_success(span, 202);
//! assert_eq!(logger.metrics().successful_requests(), 1);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const REDACTED: &str = "[REDACTED]";

/// Level at which an attempt outcome is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    #[default]
    Debug,
    Info,
    Warn,
    Error,
    /// Outcome is counted but not logged.
    Off,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        };
        f.write_str(name)
    }
}

macro_rules! http_log {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            LogLevel::Trace => trace!(target: "datadog_ci_transport::http", $($arg)+),
            LogLevel::Debug => debug!(target: "datadog_ci_transport::http", $($arg)+),
            LogLevel::Info => info!(target: "datadog_ci_transport::http", $($arg)+),
            LogLevel::Warn => warn!(target: "datadog_ci_transport::http", $($arg)+),
            LogLevel::Error => error!(target: "datadog_ci_transport::http", $($arg)+),
            LogLevel::Off => {}
        }
    };
}

/// How intake requests are logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level of the request line and of successful responses.
    pub success_level: LogLevel,
    /// Level of failed attempts, including ones that will be retried.
    pub error_level: LogLevel,
    /// Append request headers to the request line.
    pub log_headers: bool,
    /// Headers whose values are replaced by `[REDACTED]`, matched ignoring case.
    pub redacted_headers: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            success_level: LogLevel::Debug,
            error_level: LogLevel::Warn,
            log_headers: false,
            redacted_headers: vec![
                "DD-API-KEY".to_string(),
                "DD-APPLICATION-KEY".to_string(),
                "Authorization".to_string(),
            ],
        }
    }
}

impl LoggingConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_success_level(mut self, level: LogLevel) -> Self {
        self.success_level = level;
        self
    }

    #[must_use]
    pub fn with_error_level(mut self, level: LogLevel) -> Self {
        self.error_level = level;
        self
    }

    #[must_use]
    pub fn with_headers(mut self, enabled: bool) -> Self {
        self.log_headers = enabled;
        self
    }

    /// Also redact the value of `header`.
    #[must_use]
    pub fn with_redacted_header(mut self, header: impl Into<String>) -> Self {
        self.redacted_headers.push(header.into());
        self
    }

    fn is_redacted(&self, name: &str) -> bool {
        self.redacted_headers
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name))
    }

    /// Suffix appended to the request line; empty unless header logging is on.
    #[must_use]
    pub fn render_headers(&self, headers: &BTreeMap<String, String>) -> String {
        if !self.log_headers || headers.is_empty() {
            return String::new();
        }
        let rendered = headers
            .iter()
            .map(|(name, value)| {
                if self.is_redacted(name) {
                    format!("{name}={REDACTED}")
                } else {
                    format!("{name}={value:?}")
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(" headers=[{rendered}]")
    }
}

/// Attempt counters. Every retry counts as its own attempt.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl RequestMetrics {
    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.successful_requests() + self.failed_requests()
    }

    #[must_use]
    pub fn successful_requests(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed_requests(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Share of successful attempts; 1.0 before the first attempt.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        match self.total_requests() {
            0 => 1.0,
            total => self.successful_requests() as f64 / total as f64,
        }
    }
}

/// Logs and counts the attempts of one transport.
#[derive(Debug, Default)]
pub struct RequestLogger {
    config: LoggingConfig,
    metrics: RequestMetrics,
}

impl RequestLogger {
    #[must_use]
    pub fn with_config(config: LoggingConfig) -> Self {
        Self {
            config,
            metrics: RequestMetrics::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &RequestMetrics {
        &self.metrics
    }

    /// Start timing an attempt.
    #[must_use]
    pub fn start(&self, method: &str, url: &str) -> RequestSpan {
        RequestSpan {
            method: method.to_string(),
            url: url.to_string(),
            started: Instant::now(),
        }
    }

    pub fn log_request(&self, span: &RequestSpan, headers: &BTreeMap<String, String>) {
        http_log!(
            self.config.success_level,
            "{} {}{}",
            span.method,
            span.url,
            self.config.render_headers(headers)
        );
    }

    pub fn finish_success(&self, span: RequestSpan, status: u16) {
        self.metrics.record_success();
        http_log!(
            self.config.success_level,
            "{} {} answered {} after {:?}",
            span.method,
            span.url,
            status,
            span.elapsed()
        );
    }

    pub fn finish_error(&self, span: RequestSpan, cause: &str) {
        self.metrics.record_failure();
        http_log!(
            self.config.error_level,
            "{} {} failed after {:?}: {}",
            span.method,
            span.url,
            span.elapsed(),
            cause
        );
    }
}

/// Timing of one in-flight attempt.
#[derive(Debug)]
pub struct RequestSpan {
    method: String,
    url: String,
    started: Instant,
}

impl RequestSpan {
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn headers() -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("dd-api-key".to_string(), "secret".to_string());
        headers.insert("DD-CI-PROVIDER-NAME".to_string(), "jenkins".to_string());
        headers
    }

    #[test]
    fn test_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.success_level, LogLevel::Debug);
        assert_eq!(config.error_level, LogLevel::Warn);
        assert!(!config.log_headers);
        assert_eq!(config.render_headers(&headers()), "");
    }

    #[test]
    fn test_api_key_is_redacted_ignoring_case() {
        let config = LoggingConfig::new().with_headers(true);

        let rendered = config.render_headers(&headers());

        assert!(rendered.contains("dd-api-key=[REDACTED]"));
        assert!(rendered.contains("DD-CI-PROVIDER-NAME=\"jenkins\""));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_extra_redacted_header() {
        let config = LoggingConfig::new()
            .with_headers(true)
            .with_redacted_header("DD-CI-PROVIDER-NAME");

        assert!(!config.render_headers(&headers()).contains("jenkins"));
    }

    #[test]
    fn test_config_from_yaml() {
        let config: LoggingConfig =
            serde_yaml::from_str("success_level: off\nerror_level: error\nlog_headers: true\n").unwrap();

        assert_eq!(config.success_level, LogLevel::Off);
        assert_eq!(config.error_level, LogLevel::Error);
        assert!(config.log_headers);
        assert_eq!(config.redacted_headers.len(), 3);
        assert_eq!(LogLevel::Off.to_string(), "off");
    }

    #[test]
    fn test_metrics_rate() {
        let metrics = RequestMetrics::default();
        assert_eq!(metrics.success_rate(), 1.0);

        metrics.record_success();
        metrics.record_failure();
        metrics.record_failure();
        metrics.record_failure();

        assert_eq!(metrics.total_requests(), 4);
        assert_eq!(metrics.failed_requests(), 3);
        assert!((metrics.success_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    #[traced_test]
    fn test_failed_attempt_is_logged_and_counted() {
        let logger = RequestLogger::default();
        let span = logger.start("POST", "http://localhost:8126/evp_proxy/v1/api/v2/webhook");

        logger.finish_error(span, "connection refused");

        assert_eq!(logger.metrics().failed_requests(), 1);
        assert!(logs_contain("connection refused"));
    }

    #[test]
    #[traced_test]
    fn test_off_level_counts_without_logging() {
        let logger = RequestLogger::with_config(LoggingConfig::new().with_success_level(LogLevel::Off));
        let span = logger.start("GET", "https://api.datadoghq.com/api/v1/validate");

        logger.finish_success(span, 200);

        assert_eq!(logger.metrics().successful_requests(), 1);
        assert!(!logs_contain("v1/validate"));
    }
}
