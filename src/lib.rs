// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reliable delivery of CI telemetry (logs and webhook traces) to Datadog.
//!
//! Payloads are batched into size-bounded JSON arrays, optionally gzipped,
//! sent with per-attempt timeouts and exponential-backoff retries, and
//! guarded per track by a circuit breaker.

pub mod client;
pub mod config;
pub mod error;
pub mod reporter;
pub mod runtime;
pub mod sender;
pub mod testkit;
pub mod write;

pub use client::{HttpResponse, HttpTransport, TransportConfig};
pub use config::ReporterConfig;
pub use error::{ReporterError, Result};
pub use reporter::Reporter;
pub use sender::{json_mapper, PayloadMapper, PayloadSender, SendReport, SenderKind};
pub use write::{Track, WriteStrategy};
