// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reporter: owns the transport and builds per-track write strategies.
//!
//! A [`Reporter`] is constructed from a validated [`ReporterConfig`]. It
//! fixes the endpoint and headers of each track and hands out
//! [`WriteStrategy`] instances that share one connection pool.
//!
//! # Example
//!
//! ```no_run
//! use datadog_ci_transport::config::ReporterConfig;
//! use datadog_ci_transport::sender::json_mapper;
//! use datadog_ci_transport::Reporter;
//!
//! # async fn run() -> datadog_ci_transport::error::Result<()> {
//! let reporter = Reporter::connect(ReporterConfig::load_with_env()?).await?;
//! let logs = reporter.logs::<serde_json::Value>(json_mapper())?;
//!
//! logs.send(vec![serde_json::json!({"message": "build started"})]).await;
//! reporter.close();
//! # Ok(())
//! # }
//! ```

use crate::client::{Headers, HttpTransport};
use crate::config::{ReportMode, ReporterConfig, TrackSettings};
use crate::error::{ReporterError, Result};
use crate::runtime::RequestMetrics;
use crate::sender::{PayloadMapper, PayloadSender};
use crate::write::{Track, WriteStrategy};
use serde::Deserialize;
use tracing::{debug, info};

pub const HEADER_API_KEY: &str = "DD-API-KEY";
pub const HEADER_CI_PROVIDER: &str = "DD-CI-PROVIDER-NAME";
pub const HEADER_EVP_SUBDOMAIN: &str = "X-Datadog-EVP-Subdomain";
pub const CI_PROVIDER_NAME: &str = "jenkins";
pub const WEBHOOK_SUBDOMAIN: &str = "webhook-intake";

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
}

/// Configuration holder and factory of write strategies.
#[derive(Debug)]
pub struct Reporter {
    config: ReporterConfig,
    transport: HttpTransport,
}

impl Reporter {
    /// Validate `config`, build the transport and check connectivity.
    ///
    /// In `api` mode the API key is checked against `{api_url}/v1/validate`;
    /// in `agent` mode the agent's `/info` endpoint must answer.
    pub async fn connect(config: ReporterConfig) -> Result<Self> {
        let reporter = Self::new(config)?;
        reporter.check_connectivity().await?;
        info!(
            "Reporting to Datadog through {} ({})",
            reporter.config.mode,
            reporter.base_url()
        );
        Ok(reporter)
    }

    /// Validate `config` and build the transport without any network call.
    pub fn new(config: ReporterConfig) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::with_proxy_source(config.transport_config(), config.proxy_source())?;
        Ok(Self { config, transport })
    }

    /// Check that the configured target is reachable and accepts the key.
    pub async fn check_connectivity(&self) -> Result<()> {
        match self.config.mode {
            ReportMode::Api => {
                let url = format!("{}/v1/validate", trim_slash(&self.config.api_url));
                let valid = self
                    .transport
                    .get(&url, &self.api_key_headers(), |response| {
                        Ok(response.json::<ValidateResponse>()?.valid)
                    })
                    .await
                    .map_err(connectivity_error)?;
                if !valid {
                    return Err(ReporterError::Config("API key is invalid".to_string()));
                }
            }
            ReportMode::Agent => {
                let url = format!("{}/info", self.config.agent_url());
                self.transport
                    .get(&url, &Headers::new(), |_| Ok(()))
                    .await
                    .map_err(|e| match e {
                        ReporterError::Request { .. } => ReporterError::Config(format!(
                            "Unable to reach the Datadog Agent at {}: {e}",
                            self.config.agent_url()
                        )),
                        other => other,
                    })?;
            }
        }
        debug!("Connectivity check passed");
        Ok(())
    }

    /// Write strategy for the logs track. Logs are only sent over HTTP in
    /// `api` mode.
    pub fn logs<T: Send + Sync + 'static>(&self, mapper: PayloadMapper<T>) -> Result<WriteStrategy<T>> {
        let url = self.logs_url()?;
        let headers = self.api_key_headers();
        Ok(self.write_strategy(Track::Logs, url, headers, &self.config.logs, mapper))
    }

    /// Write strategy for the traces (webhook) track.
    pub fn traces<T: Send + Sync + 'static>(&self, mapper: PayloadMapper<T>) -> Result<WriteStrategy<T>> {
        let url = self.traces_url();
        let headers = self.traces_headers();
        Ok(self.write_strategy(Track::Traces, url, headers, &self.config.traces, mapper))
    }

    /// Endpoint of the logs track.
    pub fn logs_url(&self) -> Result<String> {
        match self.config.mode {
            ReportMode::Api => Ok(self.config.logs_intake_url.clone()),
            ReportMode::Agent => Err(ReporterError::Config(
                "The logs track is only available in api mode".to_string(),
            )),
        }
    }

    /// Endpoint of the traces track.
    #[must_use]
    pub fn traces_url(&self) -> String {
        match self.config.mode {
            ReportMode::Api => format!("{}/api/v2/webhook", trim_slash(&self.config.webhook_intake_url)),
            ReportMode::Agent => format!("{}/evp_proxy/v1/api/v2/webhook", self.config.agent_url()),
        }
    }

    /// Abort pending retries of every write strategy built by this reporter.
    pub fn close(&self) {
        debug!("Closing reporter");
        self.transport.cancel();
    }

    #[must_use]
    pub fn config(&self) -> &ReporterConfig {
        &self.config
    }

    #[must_use]
    pub fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    /// Request counters across all tracks.
    #[must_use]
    pub fn metrics(&self) -> &RequestMetrics {
        self.transport.metrics()
    }

    fn write_strategy<T: Send + Sync + 'static>(
        &self,
        track: Track,
        url: String,
        headers: Headers,
        settings: &TrackSettings,
        mapper: PayloadMapper<T>,
    ) -> WriteStrategy<T> {
        let kind = settings.sender_kind();
        debug!("Sending {track} to {url} ({kind}, limit {} bytes)", settings.batch_limit_bytes);
        let sender = PayloadSender::new(
            self.transport.scoped(),
            url,
            headers,
            kind,
            settings.batch_limit_bytes,
            mapper,
        );
        WriteStrategy::new(track, sender, self.config.circuit_breaker.breaker_config())
    }

    fn base_url(&self) -> String {
        match self.config.mode {
            ReportMode::Api => self.config.api_url.clone(),
            ReportMode::Agent => self.config.agent_url(),
        }
    }

    fn api_key_headers(&self) -> Headers {
        let mut headers = Headers::new();
        if let Some(key) = &self.config.api_key {
            headers.insert(HEADER_API_KEY.to_string(), key.trim().to_string());
        }
        headers
    }

    fn traces_headers(&self) -> Headers {
        let mut headers = match self.config.mode {
            ReportMode::Api => self.api_key_headers(),
            ReportMode::Agent => {
                let mut headers = Headers::new();
                headers.insert(HEADER_EVP_SUBDOMAIN.to_string(), WEBHOOK_SUBDOMAIN.to_string());
                headers
            }
        };
        headers.insert(HEADER_CI_PROVIDER.to_string(), CI_PROVIDER_NAME.to_string());
        headers
    }
}

fn trim_slash(url: &str) -> &str {
    url.trim_end_matches('/')
}

fn connectivity_error(err: ReporterError) -> ReporterError {
    match err {
        ReporterError::Request { .. } | ReporterError::Serialization(_) => {
            ReporterError::Config(format!("Connectivity check failed: {err}"))
        }
        other => other,
    }
}
