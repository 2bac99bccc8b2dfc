// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit breaker guarding a payload-sending operation.
//!
//! The breaker stops a persistently unreachable intake from stalling every
//! caller: after enough consecutive failures it short-circuits to a fallback
//! and only lets a single probe through once the health-check delay elapses.
//!
//! # States
//!
//! - **Closed**: Normal operation, payloads go to the real operation
//! - **Open**: Payloads go straight to the fallback
//! - **Half-Open**: One probe is in flight; everything else takes the fallback
//!
//! A failed probe reopens the circuit and multiplies the health-check delay by
//! the delay factor, up to the configured maximum. A successful probe closes
//! it and resets the delay to the minimum.
//!
//! # Example
//!
//! ```ignore
//! use datadog_ci_transport::runtime::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::default().with_failure_threshold(3),
//!     |batch: Vec<String>| async move {
//!         println!("sending {} items", batch.len());
//!         Ok(())
//!     },
//!     |batch: Vec<String>| println!("dropping {} items", batch.len()),
//!     |err| eprintln!("send failed: {err}"),
//! );
//!
//! breaker.accept(vec!["a".to_string()]).await;
//! ```

use crate::error::{ReporterError, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Consecutive failures that open the circuit by default.
pub const DEFAULT_FAILURE_THRESHOLD: usize = 100;
/// Initial wait between opening the circuit and the first probe.
pub const DEFAULT_MIN_HEALTH_CHECK_DELAY_MILLIS: u64 = 1_000;
/// Upper bound of the health-check delay.
pub const DEFAULT_MAX_HEALTH_CHECK_DELAY_MILLIS: u64 = 60_000;
/// Growth of the health-check delay after each failed probe.
pub const DEFAULT_DELAY_FACTOR: f64 = 2.0;

type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Action<T> = Box<dyn Fn(T) -> BoxFuture + Send + Sync>;
type Fallback<T> = Box<dyn Fn(T) + Send + Sync>;
type ErrorHandler = Box<dyn Fn(&ReporterError) + Send + Sync>;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, payloads pass through normally.
    Closed,
    /// Circuit is open, payloads go to the fallback.
    Open,
    /// A probe is in flight to test whether the intake recovered.
    HalfOpen,
}

/// Failure threshold and health-check backoff of a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: usize,
    /// Delay before the first probe after opening.
    pub min_health_check_delay: Duration,
    /// Cap on the delay between probes.
    pub max_health_check_delay: Duration,
    /// Multiplier applied to the delay after every failed probe.
    pub delay_factor: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            min_health_check_delay: Duration::from_millis(DEFAULT_MIN_HEALTH_CHECK_DELAY_MILLIS),
            max_health_check_delay: Duration::from_millis(DEFAULT_MAX_HEALTH_CHECK_DELAY_MILLIS),
            delay_factor: DEFAULT_DELAY_FACTOR,
        }
    }
}

impl CircuitBreakerConfig {
    /// Default thresholds; adjust with the `with_*` builders.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consecutive failures that open the circuit.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the initial health-check delay.
    #[must_use]
    pub fn with_min_health_check_delay(mut self, delay: Duration) -> Self {
        self.min_health_check_delay = delay;
        self
    }

    /// Set the maximum health-check delay.
    #[must_use]
    pub fn with_max_health_check_delay(mut self, delay: Duration) -> Self {
        self.max_health_check_delay = delay;
        self
    }

    /// Set the delay growth factor.
    #[must_use]
    pub fn with_delay_factor(mut self, factor: f64) -> Self {
        self.delay_factor = factor;
        self
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let factor = self.delay_factor.max(1.0);
        // Overflow, infinity and NaN all land on the cap.
        Duration::try_from_secs_f64(current.as_secs_f64() * factor)
            .unwrap_or(self.max_health_check_delay)
            .min(self.max_health_check_delay)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    health_check_delay: Duration,
}

enum Route {
    Normal,
    Probe,
    ShortCircuit,
}

/// Circuit breaker wrapping a payload-sending operation.
///
/// Safe to share between tasks; the state lock is never held across an
/// `await`.
pub struct CircuitBreaker<T> {
    config: CircuitBreakerConfig,
    action: Action<T>,
    fallback: Fallback<T>,
    error_handler: ErrorHandler,
    inner: Mutex<BreakerState>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl<T: Send + 'static> CircuitBreaker<T> {
    /// Create a circuit breaker around `action`.
    ///
    /// `fallback` receives payloads while the circuit is open and
    /// `error_handler` sees every failure of `action`.
    pub fn new<A, Fut, F, E>(config: CircuitBreakerConfig, action: A, fallback: F, error_handler: E) -> Self
    where
        A: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
        E: Fn(&ReporterError) + Send + Sync + 'static,
    {
        let health_check_delay = config.min_health_check_delay;
        Self {
            config,
            action: Box::new(move |payload| -> BoxFuture { Box::pin(action(payload)) }),
            fallback: Box::new(fallback),
            error_handler: Box::new(error_handler),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                health_check_delay,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Hand `payload` to the operation, or to the fallback if the circuit is open.
    pub async fn accept(&self, payload: T) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let route = self.route();
        if matches!(route, Route::ShortCircuit) {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            (self.fallback)(payload);
            return;
        }

        let probe = matches!(route, Route::Probe);
        let mut guard = ProbeGuard {
            breaker: self,
            armed: probe,
        };
        match (self.action)(payload).await {
            Ok(()) => self.on_success(probe),
            Err(e) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                (self.error_handler)(&e);
                self.on_failure(probe);
            }
        }
        guard.armed = false;
    }

    fn route(&self) -> Route {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Route::Normal,
            CircuitState::HalfOpen => Route::ShortCircuit,
            CircuitState::Open => {
                let due = inner
                    .opened_at
                    .map_or(true, |opened| opened.elapsed() >= inner.health_check_delay);
                if due {
                    inner.state = CircuitState::HalfOpen;
                    debug!(target: "datadog_ci_transport::circuit_breaker", "Probing intake after {:?}", inner.health_check_delay);
                    Route::Probe
                } else {
                    Route::ShortCircuit
                }
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            info!(target: "datadog_ci_transport::circuit_breaker", "Probe succeeded, closing circuit");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.health_check_delay = self.config.min_health_check_delay;
        }
        if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.health_check_delay = self.config.next_delay(inner.health_check_delay);
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                target: "datadog_ci_transport::circuit_breaker",
                "Probe failed, next health check in {:?}",
                inner.health_check_delay
            );
            return;
        }
        if inner.state != CircuitState::Closed {
            return;
        }
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.config.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.health_check_delay = self.config.min_health_check_delay;
            warn!(
                target: "datadog_ci_transport::circuit_breaker",
                "Opening circuit after {} consecutive failures",
                inner.consecutive_failures
            );
        }
    }
}

impl<T> CircuitBreaker<T> {
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get the current circuit state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Force the circuit closed and forget the failure streak.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.health_check_delay = self.config.min_health_check_delay;
    }

    /// Time left before the next probe is allowed, if the circuit is open.
    #[must_use]
    pub fn time_until_probe(&self) -> Option<Duration> {
        let inner = self.lock();
        if inner.state != CircuitState::Open {
            return None;
        }
        inner
            .opened_at
            .map(|opened| inner.health_check_delay.saturating_sub(opened.elapsed()))
    }

    /// Current delay between probes.
    #[must_use]
    pub fn health_check_delay(&self) -> Duration {
        self.lock().health_check_delay
    }

    /// Get the current consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.lock().consecutive_failures
    }

    /// Payloads offered, whether run or rejected.
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Failed actions since creation, including health checks.
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Get total number of short-circuited calls.
    #[must_use]
    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }

    /// Failures over calls; 0.0 before the first call.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.total_calls.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let failures = self.total_failures.load(Ordering::Relaxed);
        failures as f64 / total as f64
    }

    /// Thresholds and health-check delays in use.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

/// Reopens the circuit if a probe is dropped before it completes, so the
/// breaker never stays half-open.
struct ProbeGuard<'a, T> {
    breaker: &'a CircuitBreaker<T>,
    armed: bool,
}

impl<T> Drop for ProbeGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
        }
    }
}
