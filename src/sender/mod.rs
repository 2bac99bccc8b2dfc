// SPDX-License-Identifier: MIT OR Apache-2.0

//! Payload senders.
//!
//! A [`PayloadSender`] turns a collection of items into as few HTTP requests
//! as the byte limit allows. Items are serialized by a caller-supplied
//! [`PayloadMapper`]; the sender only measures the resulting bytes.
//!
//! Batches are JSON arrays (`[a,b,c]`) whose uncompressed length never
//! exceeds the limit. An item that cannot fit even alone (`len + 2 > limit`)
//! is dropped and logged. An empty input still produces one request with
//! body `[]` so callers get an acknowledgement.

mod batch;

use crate::client::{Headers, HttpTransport};
use crate::error::Result;
use batch::BatchBuffer;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Content type of every payload request.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Serializes one item to the bytes sent on the wire.
pub type PayloadMapper<T> = Arc<dyn Fn(&T) -> Result<Vec<u8>> + Send + Sync>;

/// Mapper that serializes items with `serde_json`.
#[must_use]
pub fn json_mapper<T: Serialize + 'static>() -> PayloadMapper<T> {
    Arc::new(|item: &T| Ok(serde_json::to_vec(item)?))
}

/// Body compression for batched requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

/// How a sender groups items into requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderKind {
    /// JSON-array batches bounded by the byte limit.
    Batched { compression: Compression },
    /// One request per item, raw body, never compressed.
    PerItem,
}

impl SenderKind {
    /// Select the variant from track flags.
    #[must_use]
    pub fn from_flags(batching: bool, compression: bool) -> Self {
        if !batching {
            return SenderKind::PerItem;
        }
        let compression = if compression {
            Compression::Gzip
        } else {
            Compression::None
        };
        SenderKind::Batched { compression }
    }

    fn compression(self) -> Compression {
        match self {
            SenderKind::Batched { compression } => compression,
            SenderKind::PerItem => Compression::None,
        }
    }
}

impl fmt::Display for SenderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderKind::Batched {
                compression: Compression::None,
            } => write!(f, "batched"),
            SenderKind::Batched {
                compression: Compression::Gzip,
            } => write!(f, "batched+gzip"),
            SenderKind::PerItem => write!(f, "per-item"),
        }
    }
}

/// What one `send` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    /// HTTP requests issued.
    pub requests: usize,
    /// Items included in a successful request.
    pub items_sent: usize,
    /// Items dropped as oversized or unserializable.
    pub items_dropped: usize,
    /// Body bytes sent, after compression.
    pub bytes_sent: usize,
}

/// Sends collections of `T` to one URL with fixed headers.
pub struct PayloadSender<T> {
    transport: HttpTransport,
    url: String,
    headers: Headers,
    kind: SenderKind,
    batch_limit_bytes: usize,
    mapper: PayloadMapper<T>,
}

impl<T> Clone for PayloadSender<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            kind: self.kind,
            batch_limit_bytes: self.batch_limit_bytes,
            mapper: Arc::clone(&self.mapper),
        }
    }
}

impl<T> fmt::Debug for PayloadSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadSender")
            .field("url", &self.url)
            .field("kind", &self.kind)
            .field("batch_limit_bytes", &self.batch_limit_bytes)
            .finish_non_exhaustive()
    }
}

impl<T> PayloadSender<T> {
    /// Create a sender. `Content-Encoding: gzip` is added to `headers` when
    /// the kind compresses.
    pub fn new(
        transport: HttpTransport,
        url: impl Into<String>,
        mut headers: Headers,
        kind: SenderKind,
        batch_limit_bytes: usize,
        mapper: PayloadMapper<T>,
    ) -> Self {
        if kind.compression() == Compression::Gzip {
            headers.insert("Content-Encoding".to_string(), "gzip".to_string());
        }
        Self {
            transport,
            url: url.into(),
            headers,
            kind,
            batch_limit_bytes,
            mapper,
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[must_use]
    pub fn kind(&self) -> SenderKind {
        self.kind
    }

    #[must_use]
    pub fn batch_limit_bytes(&self) -> usize {
        self.batch_limit_bytes
    }

    #[must_use]
    pub fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    /// Send `payloads` in iteration order. Fails on the first request that
    /// fails after retries; earlier requests stay sent.
    pub async fn send(&self, payloads: &[T]) -> Result<SendReport> {
        match self.kind {
            SenderKind::Batched { compression } => self.send_batched(payloads, compression).await,
            SenderKind::PerItem => self.send_per_item(payloads).await,
        }
    }

    /// Serialize `item`, or `None` if it must be dropped.
    fn map_item(&self, item: &T) -> Option<Vec<u8>> {
        let body = match (self.mapper)(item) {
            Ok(body) => body,
            Err(e) => {
                error!(target: "datadog_ci_transport::sender", "Dropping payload that failed to serialize: {e}");
                return None;
            }
        };
        if body.len() + 2 > self.batch_limit_bytes {
            error!(
                target: "datadog_ci_transport::sender",
                "Dropping payload of {} bytes, it exceeds the batch limit of {} bytes",
                body.len(),
                self.batch_limit_bytes
            );
            return None;
        }
        Some(body)
    }

    async fn send_batched(&self, payloads: &[T], compression: Compression) -> Result<SendReport> {
        let mut report = SendReport::default();
        let mut buffer = BatchBuffer::open(compression)?;

        for item in payloads {
            let Some(body) = self.map_item(item) else {
                report.items_dropped += 1;
                continue;
            };
            if !buffer.fits(body.len(), self.batch_limit_bytes) {
                let full = std::mem::replace(&mut buffer, BatchBuffer::open(compression)?);
                self.flush(full, &mut report).await?;
            }
            buffer.push(&body)?;
        }

        self.flush(buffer, &mut report).await?;
        Ok(report)
    }

    async fn flush(&self, buffer: BatchBuffer, report: &mut SendReport) -> Result<()> {
        let items = buffer.items();
        let (body, uncompressed_len) = buffer.close()?;
        debug!(
            target: "datadog_ci_transport::sender",
            "Sending batch of {items} items ({uncompressed_len} bytes, {} on the wire) to {}",
            body.len(),
            self.url
        );
        let wire_len = body.len();
        self.post(Bytes::from(body)).await?;
        report.requests += 1;
        report.items_sent += items;
        report.bytes_sent += wire_len;
        Ok(())
    }

    async fn send_per_item(&self, payloads: &[T]) -> Result<SendReport> {
        let mut report = SendReport::default();
        for item in payloads {
            let Some(body) = self.map_item(item) else {
                report.items_dropped += 1;
                continue;
            };
            let wire_len = body.len();
            self.post(Bytes::from(body)).await?;
            report.requests += 1;
            report.items_sent += 1;
            report.bytes_sent += wire_len;
        }
        Ok(report)
    }

    async fn post(&self, body: Bytes) -> Result<()> {
        self.transport
            .post(&self.url, &self.headers, CONTENT_TYPE_JSON, body, |_| Ok(()))
            .await
    }
}
