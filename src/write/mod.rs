// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-track write strategies.
//!
//! A [`WriteStrategy`] binds one [`PayloadSender`] to one [`CircuitBreaker`].
//! Callers hand it collections of items; failures are absorbed and logged,
//! never returned.

use crate::error::ReporterError;
use crate::runtime::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::sender::PayloadSender;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, warn};

/// Telemetry track served by a write strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    Logs,
    Traces,
}

impl Track {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Track::Logs => "logs",
            Track::Traces => "traces",
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sends one track's payloads through a circuit breaker.
pub struct WriteStrategy<T> {
    track: Track,
    sender: PayloadSender<T>,
    breaker: CircuitBreaker<Vec<T>>,
    closed: AtomicBool,
}

impl<T> fmt::Debug for WriteStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteStrategy")
            .field("track", &self.track)
            .field("sender", &self.sender)
            .field("state", &self.breaker.state())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Send + Sync + 'static> WriteStrategy<T> {
    /// Wrap `sender` in a circuit breaker configured by `breaker`.
    ///
    /// `close` cancels the sender's transport, so pass a sender built on a
    /// [scoped](crate::client::HttpTransport::scoped) transport when the
    /// transport is shared.
    pub fn new(track: Track, sender: PayloadSender<T>, breaker: CircuitBreakerConfig) -> Self {
        let action_sender = sender.clone();
        let breaker = CircuitBreaker::new(
            breaker,
            move |payloads: Vec<T>| {
                let sender = action_sender.clone();
                async move {
                    let report = sender.send(&payloads).await?;
                    debug!(
                        target: "datadog_ci_transport::write",
                        track = %track,
                        "Sent {} items in {} requests ({} dropped, {} bytes)",
                        report.items_sent,
                        report.requests,
                        report.items_dropped,
                        report.bytes_sent
                    );
                    Ok::<(), ReporterError>(())
                }
            },
            move |payloads: Vec<T>| {
                debug!(
                    target: "datadog_ci_transport::write",
                    track = %track,
                    "Circuit open, dropping {} items",
                    payloads.len()
                );
            },
            move |e: &ReporterError| match e {
                ReporterError::Interrupted(_) => {
                    debug!(target: "datadog_ci_transport::write", track = %track, "Send interrupted: {e}");
                }
                _ => error!(target: "datadog_ci_transport::write", track = %track, "Failed to send {track}: {e}"),
            },
        );
        Self {
            track,
            sender,
            breaker,
            closed: AtomicBool::new(false),
        }
    }

    /// Send `payloads`, or drop them if the strategy is closed or the
    /// circuit is open.
    pub async fn send(&self, payloads: Vec<T>) {
        if self.closed.load(Ordering::Acquire) {
            warn!(
                target: "datadog_ci_transport::write",
                track = %self.track,
                "Write strategy closed, dropping {} items",
                payloads.len()
            );
            return;
        }
        self.breaker.accept(payloads).await;
    }
}

impl<T> WriteStrategy<T> {
    /// Stop accepting payloads and abort pending retries. Nothing is flushed.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(target: "datadog_ci_transport::write", track = %self.track, "Closing write strategy");
            self.sender.transport().cancel();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn track(&self) -> Track {
        self.track
    }

    #[must_use]
    pub fn sender(&self) -> &PayloadSender<T> {
        &self.sender
    }

    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    #[must_use]
    pub fn circuit_breaker(&self) -> &CircuitBreaker<Vec<T>> {
        &self.breaker
    }
}
