// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP transport for intake requests.
//!
//! [`HttpTransport`] executes one logical request as a series of attempts.
//! Each attempt is classified as success, [`AttemptError::Retryable`] or
//! [`AttemptError::Terminal`]; retryable failures consult a fresh
//! [`RetryPolicy`](crate::runtime::RetryPolicy) and sleep for its backoff
//! before the next attempt. The timeout applies to each attempt separately.

pub mod proxy;

use crate::error::{ReporterError, Result};
use crate::runtime::{LoggingConfig, RequestLogger, RequestMetrics, RetryPolicyFactory, RetryableStatuses};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use proxy::{EnvProxySource, ProxyCache, ProxySource};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};

pub use proxy::{NoProxyMatcher, ProxySettings, StaticProxySource};

/// Request headers, unique and case-sensitive by key.
pub type Headers = BTreeMap<String, String>;

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the proxy source is re-read.
pub const DEFAULT_PROXY_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// A received response: status plus the full body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Any 2xx status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Outcome of one failed attempt.
#[derive(Debug, Clone)]
pub enum AttemptError {
    /// Worth another attempt if the retry budget allows.
    Retryable {
        cause: String,
        response: Option<HttpResponse>,
    },
    /// Retrying cannot help.
    Terminal {
        reason: String,
        response: Option<HttpResponse>,
    },
}

impl AttemptError {
    fn message(&self) -> &str {
        match self {
            AttemptError::Retryable { cause, .. } => cause,
            AttemptError::Terminal { reason, .. } => reason,
        }
    }
}

/// User-facing hint for a status that will not be retried.
#[must_use]
pub fn status_hint(status: u16) -> String {
    match status {
        403 => "API key might be invalid".to_string(),
        400 | 404 => "request URL might be invalid".to_string(),
        401 => "request was not authorized, API key might be missing".to_string(),
        s if (400..500).contains(&s) => format!("request rejected by the server ({s})"),
        s => format!("unexpected response status {s}"),
    }
}

/// Transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout of a single attempt.
    pub timeout: Duration,
    pub retry: RetryPolicyFactory,
    pub retryable: RetryableStatuses,
    pub logging: LoggingConfig,
    pub user_agent: String,
    pub proxy_refresh_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicyFactory::default(),
            retryable: RetryableStatuses::default(),
            logging: LoggingConfig::default(),
            user_agent: format!("datadog-ci-transport/{}", env!("CARGO_PKG_VERSION")),
            proxy_refresh_interval: DEFAULT_PROXY_REFRESH_INTERVAL,
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicyFactory) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: RetryableStatuses) -> Self {
        self.retryable = retryable;
        self
    }

    #[must_use]
    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn with_proxy_refresh_interval(mut self, interval: Duration) -> Self {
        self.proxy_refresh_interval = interval;
        self
    }
}

/// Shared, cloneable HTTP transport.
///
/// Clones share the connection pool and metrics. [`HttpTransport::scoped`]
/// gives a clone whose cancellation does not affect the parent.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    config: Arc<TransportConfig>,
    clients: Arc<ProxyCache>,
    logger: Arc<RequestLogger>,
    cancel: CancellationToken,
}

impl HttpTransport {
    /// Build a transport that follows the process proxy environment.
    pub fn new(config: TransportConfig) -> Result<Self> {
        Self::with_proxy_source(config, Arc::new(EnvProxySource))
    }

    /// Build a transport with an explicit proxy source.
    pub fn with_proxy_source(config: TransportConfig, source: Arc<dyn ProxySource>) -> Result<Self> {
        let clients = ProxyCache::new(source, config.proxy_refresh_interval, config.user_agent.clone())?;
        let logger = RequestLogger::with_config(config.logging.clone());
        Ok(Self {
            config: Arc::new(config),
            clients: Arc::new(clients),
            logger: Arc::new(logger),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Counters over every attempt made by this transport and its clones.
    #[must_use]
    pub fn metrics(&self) -> &RequestMetrics {
        self.logger.metrics()
    }

    /// A clone with a child cancellation token.
    #[must_use]
    pub fn scoped(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// Abort pending backoffs and in-flight attempts of this transport and
    /// its scoped children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// GET `url`, retrying per policy, and parse the successful response.
    pub async fn get<T, F>(&self, url: &str, headers: &Headers, parser: F) -> Result<T>
    where
        F: FnOnce(HttpResponse) -> Result<T>,
    {
        let response = self.execute(Method::GET, url, headers, None, None).await?;
        parser(response)
    }

    /// POST `body` to `url`, retrying per policy, and parse the successful
    /// response.
    pub async fn post<T, F>(
        &self,
        url: &str,
        headers: &Headers,
        content_type: &str,
        body: Bytes,
        parser: F,
    ) -> Result<T>
    where
        F: FnOnce(HttpResponse) -> Result<T>,
    {
        let response = self
            .execute(Method::POST, url, headers, Some(content_type), Some(body))
            .await?;
        parser(response)
    }

    /// POST in a background task. Final failures are logged, never returned.
    pub fn post_asynchronously(
        &self,
        url: &str,
        headers: &Headers,
        content_type: &str,
        body: Bytes,
    ) -> JoinHandle<()> {
        let transport = self.clone();
        let url = url.to_string();
        let headers = headers.clone();
        let content_type = content_type.to_string();
        let task = async move {
            let outcome = transport
                .execute(Method::POST, &url, &headers, Some(&content_type), Some(body))
                .await;
            if let Err(e) = outcome {
                error!(target: "datadog_ci_transport::http", "Asynchronous request failed: {e}");
            }
        };
        // Logged under the caller's span.
        tokio::spawn(task.instrument(tracing::Span::current()))
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: &Headers,
        content_type: Option<&str>,
        body: Option<Bytes>,
    ) -> Result<HttpResponse> {
        let header_map = build_headers(headers, content_type)?;
        let mut policy = self.config.retry.create();

        loop {
            if self.cancel.is_cancelled() {
                return Err(ReporterError::Interrupted(format!("{method} {url} cancelled")));
            }

            let span = self.logger.start(method.as_str(), url);
            self.logger.log_request(&span, headers);

            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.logger.finish_error(span, "cancelled");
                    return Err(ReporterError::Interrupted(format!("{method} {url} cancelled")));
                }
                outcome = self.attempt(method.clone(), url, header_map.clone(), body.clone()) => outcome,
            };

            let failure = match outcome {
                Ok(response) => {
                    self.logger.finish_success(span, response.status);
                    return Ok(response);
                }
                Err(failure) => failure,
            };
            self.logger.finish_error(span, failure.message());

            match failure {
                AttemptError::Terminal { reason, response } => {
                    return Err(ReporterError::Request {
                        url: url.to_string(),
                        status: response.map(|r| r.status),
                        message: reason,
                    });
                }
                AttemptError::Retryable { cause, response } => {
                    if !policy.should_retry(response.as_ref()) {
                        return Err(ReporterError::Request {
                            url: url.to_string(),
                            status: policy.last_status(),
                            message: format!("giving up after {} attempts: {cause}", policy.attempts()),
                        });
                    }
                    let delay = policy.backoff();
                    debug!(
                        target: "datadog_ci_transport::http",
                        "Retrying {method} {url} in {delay:?} (attempt {} of {})",
                        policy.attempts(),
                        self.config.retry.max_attempts()
                    );
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => {
                            return Err(ReporterError::Interrupted(format!(
                                "{method} {url} cancelled during backoff"
                            )));
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> std::result::Result<HttpResponse, AttemptError> {
        let client = self.clients.client();
        let mut request = client
            .request(method, url)
            .headers(headers)
            .timeout(self.config.timeout);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return Err(AttemptError::Terminal {
                    reason: format!("invalid request: {e}"),
                    response: None,
                });
            }
            Err(e) => {
                return Err(AttemptError::Retryable {
                    cause: e.to_string(),
                    response: None,
                });
            }
        };

        let status = response.status().as_u16();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                return Err(AttemptError::Retryable {
                    cause: format!("failed to read response body: {e}"),
                    response: None,
                });
            }
        };
        let response = HttpResponse::new(status, body);

        if response.is_success() {
            Ok(response)
        } else if self.config.retryable.is_retryable(status) {
            Err(AttemptError::Retryable {
                cause: format!("server responded with status {status}"),
                response: Some(response),
            })
        } else {
            Err(AttemptError::Terminal {
                reason: status_hint(status),
                response: Some(response),
            })
        }
    }
}

fn build_headers(headers: &Headers, content_type: Option<&str>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len() + 1);
    if let Some(content_type) = content_type {
        let value = HeaderValue::from_str(content_type)
            .map_err(|e| ReporterError::Config(format!("Invalid content type {content_type:?}: {e}")))?;
        map.insert(http::header::CONTENT_TYPE, value);
    }
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ReporterError::Config(format!("Invalid header name {name:?}: {e}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| ReporterError::Config(format!("Invalid value for header {name}: {e}")))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests;
