// SPDX-License-Identifier: MIT OR Apache-2.0

//! Outbound proxy settings and the HTTP client cache that follows them.
//!
//! The effective proxy configuration can change while the process runs, so
//! [`ProxyCache`] re-reads its [`ProxySource`] at most once per refresh
//! interval and rebuilds the underlying `reqwest::Client` only when the
//! settings actually changed. A single mutex guards the cached client.

use crate::error::{ReporterError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Proxy endpoint plus the hosts that must bypass it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Proxy host, optionally with a scheme (`http://proxy.local`).
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Glob patterns (`*.internal`, `localhost`) of hosts reached directly.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub no_proxy_hosts: Vec<String>,
}

impl ProxySettings {
    /// Create settings for `host:port` with no exclusions.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            no_proxy_hosts: Vec::new(),
        }
    }

    /// Add a host pattern that bypasses the proxy.
    #[must_use]
    pub fn with_no_proxy_host(mut self, pattern: impl Into<String>) -> Self {
        self.no_proxy_hosts.push(pattern.into());
        self
    }

    /// The proxy as a URL, defaulting to the `http` scheme.
    pub fn proxy_url(&self) -> Result<Url> {
        let raw = if self.host.contains("://") {
            format!("{}:{}", self.host.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        };
        Url::parse(&raw).map_err(|e| ReporterError::Config(format!("Invalid proxy {raw}: {e}")))
    }

    /// Compile the no-proxy patterns.
    #[must_use]
    pub fn matcher(&self) -> NoProxyMatcher {
        NoProxyMatcher::new(&self.no_proxy_hosts)
    }
}

/// Matches hosts against no-proxy glob patterns, case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct NoProxyMatcher {
    patterns: Vec<Regex>,
}

impl NoProxyMatcher {
    /// Compile `patterns`; `*` matches any run of characters.
    #[must_use]
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .filter_map(|p| {
                let glob = if let Some(domain) = p.strip_prefix('.') {
                    format!("*.{domain}")
                } else {
                    p.to_string()
                };
                let expr = format!("(?i)^{}$", regex::escape(&glob).replace(r"\*", ".*"));
                match Regex::new(&expr) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!("Ignoring no-proxy pattern {p:?}: {e}");
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }

    /// Returns `true` if `host` must not go through the proxy.
    #[must_use]
    pub fn excludes(&self, host: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(host))
    }
}

/// Where the effective proxy settings come from.
pub trait ProxySource: Send + Sync {
    /// The proxy to use right now, or `None` for direct connections.
    fn current(&self) -> Option<ProxySettings>;
}

/// Reads `HTTPS_PROXY`/`HTTP_PROXY` and `NO_PROXY` (either case).
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvProxySource;

impl EnvProxySource {
    fn var(names: &[&str]) -> Option<String> {
        names
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }
}

impl ProxySource for EnvProxySource {
    fn current(&self) -> Option<ProxySettings> {
        let raw = Self::var(&["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"])?;
        let with_scheme = if raw.contains("://") {
            raw.clone()
        } else {
            format!("http://{raw}")
        };
        let url = match Url::parse(&with_scheme) {
            Ok(url) => url,
            Err(e) => {
                warn!("Ignoring malformed proxy setting {raw:?}: {e}");
                return None;
            }
        };
        let host = url.host_str()?;
        let host = format!("{}://{}", url.scheme(), host);
        let port = url.port_or_known_default().unwrap_or(80);
        let no_proxy_hosts = Self::var(&["NO_PROXY", "no_proxy"])
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();
        Some(ProxySettings {
            host,
            port,
            no_proxy_hosts,
        })
    }
}

/// Fixed settings, for configuration files and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticProxySource(pub Option<ProxySettings>);

impl ProxySource for StaticProxySource {
    fn current(&self) -> Option<ProxySettings> {
        self.0.clone()
    }
}

#[derive(Debug)]
struct CachedClient {
    settings: Option<ProxySettings>,
    client: reqwest::Client,
    checked_at: Instant,
}

/// Read-through cache of the `reqwest::Client` matching the current proxy.
pub struct ProxyCache {
    source: Arc<dyn ProxySource>,
    refresh_interval: Duration,
    user_agent: String,
    cached: Mutex<CachedClient>,
}

impl std::fmt::Debug for ProxyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCache")
            .field("refresh_interval", &self.refresh_interval)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl ProxyCache {
    /// Build the initial client from the source's current settings.
    pub fn new(
        source: Arc<dyn ProxySource>,
        refresh_interval: Duration,
        user_agent: impl Into<String>,
    ) -> Result<Self> {
        let user_agent = user_agent.into();
        let settings = source.current();
        let client = build_client(settings.as_ref(), &user_agent)?;
        Ok(Self {
            source,
            refresh_interval,
            user_agent,
            cached: Mutex::new(CachedClient {
                settings,
                client,
                checked_at: Instant::now(),
            }),
        })
    }

    /// The client for the current proxy settings.
    ///
    /// Re-reads the source when the refresh interval elapsed; a rebuild
    /// failure keeps the previous client.
    pub fn client(&self) -> reqwest::Client {
        let mut cached = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if cached.checked_at.elapsed() < self.refresh_interval {
            return cached.client.clone();
        }
        cached.checked_at = Instant::now();

        let current = self.source.current();
        if current != cached.settings {
            match build_client(current.as_ref(), &self.user_agent) {
                Ok(client) => {
                    info!(
                        "Proxy settings changed, now {}",
                        current
                            .as_ref()
                            .map_or_else(|| "direct".to_string(), |s| format!("{}:{}", s.host, s.port))
                    );
                    cached.client = client;
                    cached.settings = current;
                }
                Err(e) => warn!("Keeping previous HTTP client: {e}"),
            }
        }
        cached.client.clone()
    }

    /// Settings the cached client was built with.
    #[must_use]
    pub fn settings(&self) -> Option<ProxySettings> {
        self.cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .settings
            .clone()
    }
}

fn build_client(settings: Option<&ProxySettings>, user_agent: &str) -> Result<reqwest::Client> {
    let builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .pool_idle_timeout(Duration::from_secs(90));

    let builder = match settings {
        Some(settings) => {
            let proxy_url = settings.proxy_url()?;
            let matcher = settings.matcher();
            debug!("Routing requests through proxy {proxy_url}");
            builder.proxy(reqwest::Proxy::custom(move |url| {
                let host = url.host_str().unwrap_or_default();
                if matcher.excludes(host) {
                    None
                } else {
                    Some(proxy_url.clone())
                }
            }))
        }
        None => builder.no_proxy(),
    };

    builder
        .build()
        .map_err(|e| ReporterError::Config(format!("Failed to build HTTP client: {e}")))
}
