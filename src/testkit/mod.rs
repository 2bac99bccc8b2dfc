// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers for tests that inspect captured intake requests.

use crate::error::{ReporterError, Result};
use flate2::read::GzDecoder;
use serde_json::Value;
use std::io::Read;

/// Decode a captured batch body into its JSON array items.
///
/// `gzip` selects whether the body is decompressed first.
pub fn decode_body(body: &[u8], gzip: bool) -> Result<Vec<Value>> {
    let raw = if gzip {
        let mut decoded = Vec::new();
        GzDecoder::new(body).read_to_end(&mut decoded)?;
        decoded
    } else {
        body.to_vec()
    };
    match serde_json::from_slice(&raw)? {
        Value::Array(items) => Ok(items),
        other => Err(ReporterError::Serialization(format!(
            "expected a JSON array batch, got {other}"
        ))),
    }
}

/// Whether a captured request carried `Content-Encoding: gzip`.
#[must_use]
pub fn is_gzip(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_ENCODING)
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"))
}
