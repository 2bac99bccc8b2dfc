// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runtime utilities for resilience and observability.
//!
//! This module provides the retry policies, circuit breaker and request
//! logging used by the transport and the write strategies.

mod circuit_breaker;
mod logging;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, DEFAULT_DELAY_FACTOR,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_MAX_HEALTH_CHECK_DELAY_MILLIS,
    DEFAULT_MIN_HEALTH_CHECK_DELAY_MILLIS,
};
pub use logging::{LogLevel, LoggingConfig, RequestLogger, RequestMetrics, RequestSpan};
pub use retry::{ExponentialBackoff, RetryPolicy, RetryPolicyFactory, RetryableStatuses};
