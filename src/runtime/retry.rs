// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policies and backoff strategies for resilient intake requests.
//!
//! A [`RetryPolicyFactory`] holds immutable settings and hands out a fresh
//! [`RetryPolicy`] for every logical request, so no two requests ever share a
//! retry budget.
//!
//! # Example
//!
//! ```
//! use datadog_ci_transport::runtime::RetryPolicyFactory;
//! use std::time::Duration;
//!
//! let factory = RetryPolicyFactory::new(3, Duration::from_millis(100), 2.0);
//! let mut policy = factory.create();
//!
//! assert!(policy.should_retry(None));
//! assert_eq!(policy.backoff(), Duration::from_millis(100));
//! assert!(policy.should_retry(None));
//! assert_eq!(policy.backoff(), Duration::from_millis(200));
//! assert!(!policy.should_retry(None));
//! ```

use crate::client::HttpResponse;
use std::collections::BTreeSet;
use std::time::Duration;

/// Delay before the k-th retry: `initial_delay * multiplier^(k-1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    /// Doubling backoff starting at `initial_delay`, capped at 30 seconds.
    #[must_use]
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    #[must_use]
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Delay before retry number `retry`, counted from zero.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        // NaN and infinity both land on the cap.
        if millis.is_finite() && millis < cap {
            Duration::from_millis(millis as u64)
        } else {
            self.max_delay
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

// =============================================================================
// Retryable statuses
// =============================================================================

/// The set of HTTP statuses that are worth another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryableStatuses {
    codes: BTreeSet<u16>,
}

impl RetryableStatuses {
    /// Retry exactly the given statuses.
    #[must_use]
    pub fn new(codes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            codes: codes.into_iter().collect(),
        }
    }

    /// Never retry on a status; only transport failures are retried.
    #[must_use]
    pub fn none() -> Self {
        Self::new(std::iter::empty())
    }

    /// Add a status to the set.
    #[must_use]
    pub fn with_status(mut self, code: u16) -> Self {
        self.codes.insert(code);
        self
    }

    /// Returns `true` if a response with this status should be retried.
    #[must_use]
    pub fn is_retryable(&self, status: u16) -> bool {
        self.codes.contains(&status)
    }
}

impl Default for RetryableStatuses {
    /// 429 and the whole 5xx family.
    fn default() -> Self {
        Self::new(std::iter::once(429).chain(500..=599))
    }
}

// =============================================================================
// Retry policy
// =============================================================================

/// Immutable retry settings; creates one [`RetryPolicy`] per logical request.
#[derive(Debug, Clone)]
pub struct RetryPolicyFactory {
    max_attempts: u32,
    backoff: ExponentialBackoff,
}

impl RetryPolicyFactory {
    /// Allow up to `max_attempts` attempts in total, waiting
    /// `base_delay * multiplier^(k-1)` before the k-th retry.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: ExponentialBackoff::new(base_delay)
                .with_multiplier(multiplier)
                .with_max_delay(Duration::MAX),
        }
    }

    /// Single attempt, never retried.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    /// Cap every backoff at `max_delay`.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.backoff = self.backoff.with_max_delay(max_delay);
        self
    }

    /// Total number of attempts a policy allows.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// A fresh policy with its own attempt counter.
    #[must_use]
    pub fn create(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            attempts: 1,
            backoff: self.backoff,
            last_status: None,
        }
    }
}

impl Default for RetryPolicyFactory {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(100), 2.0).with_max_delay(Duration::from_secs(10))
    }
}

/// Retry state for one logical request. Single use; never shared.
#[derive(Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    attempts: u32,
    backoff: ExponentialBackoff,
    last_status: Option<u16>,
}

impl RetryPolicy {
    /// Consulted after a failed attempt. `response` is `None` when the
    /// attempt failed before any response arrived.
    ///
    /// Returns `false` once the attempt budget is spent; otherwise counts
    /// the upcoming attempt and returns `true`.
    pub fn should_retry(&mut self, response: Option<&HttpResponse>) -> bool {
        self.last_status = response.map(|r| r.status);
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.attempts += 1;
        true
    }

    /// Delay before the attempt granted by the last `should_retry`.
    #[must_use]
    pub fn backoff(&self) -> Duration {
        let retry = self.attempts.saturating_sub(2);
        self.backoff.delay(retry)
    }

    /// Attempts made so far, counting the one in progress.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Status of the response passed to the last `should_retry`, if any.
    #[must_use]
    pub fn last_status(&self) -> Option<u16> {
        self.last_status
    }
}
