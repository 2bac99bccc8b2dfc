// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration management for the reporter
//!
//! This module loads [`ReporterConfig`] from a YAML file and applies
//! environment overrides.
//!
//! # Environment Variables
//!
//! The following environment variables are supported:
//!
//! - `DATADOG_CI_TRANSPORT_CONFIG` - Path to the config file (default: `~/.datadog/ci-transport.yaml`)
//! - `DATADOG_JENKINS_PLUGIN_REPORT_WITH` - `api` or `agent`
//! - `DATADOG_JENKINS_PLUGIN_TARGET_API_URL`, `..._TARGET_LOG_INTAKE_URL`,
//!   `..._TARGET_WEBHOOK_INTAKE_URL` - Intake URLs in `api` mode
//! - `DATADOG_JENKINS_PLUGIN_TARGET_API_KEY` - API key
//! - `DATADOG_JENKINS_PLUGIN_TARGET_HOST`, `..._TARGET_TRACE_COLLECTION_PORT` - Agent address
//! - `DATADOG_JENKINS_PLUGIN_ENABLE_LOG_BATCHING`, `..._ENABLE_TRACE_BATCHING`,
//!   `..._ENABLE_COMPRESSION` - Sender flags
//!
//! # Example
//!
//! ```no_run
//! use datadog_ci_transport::config::ReporterConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load with environment variable overrides
//! let config = ReporterConfig::load_with_env()?;
//! config.validate()?;
//!
//! println!("Reporting through {}", config.mode);
//! # Ok(())
//! # }
//! ```

mod reporter_config;

pub use reporter_config::{
    CircuitBreakerSettings, ReportMode, ReporterConfig, RetrySettings, TrackSettings,
    DEFAULT_AGENT_HOST, DEFAULT_AGENT_TRACE_PORT, DEFAULT_API_URL, DEFAULT_BATCH_LIMIT_BYTES,
    DEFAULT_LOGS_INTAKE_URL, DEFAULT_WEBHOOK_INTAKE_URL, ENV_AGENT_HOST, ENV_API_KEY, ENV_API_URL,
    ENV_COMPRESSION, ENV_CONFIG_PATH, ENV_LOG_BATCHING, ENV_LOG_INTAKE_URL, ENV_REPORT_WITH,
    ENV_TRACE_BATCHING, ENV_TRACE_PORT, ENV_WEBHOOK_INTAKE_URL,
};
