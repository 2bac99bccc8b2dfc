// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A request that could not be completed, after retries where applicable.
    #[error("Request to {url} failed{}: {message}", status_suffix(.status))]
    Request {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation interrupted: {0}")]
    Interrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReporterError {
    /// HTTP status of the last response, when the error came from one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            ReporterError::Request { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ReporterError {
    fn from(err: serde_json::Error) -> Self {
        ReporterError::Serialization(err.to_string())
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with status {s}")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, ReporterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_error_display_with_status() {
        let err = ReporterError::Request {
            url: "https://example.com/v1/input".to_string(),
            status: Some(403),
            message: "API key might be invalid".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Request to https://example.com/v1/input failed with status 403: API key might be invalid"
        );
        assert_eq!(err.status(), Some(403));
    }

    #[test]
    fn test_request_error_display_without_status() {
        let err = ReporterError::Request {
            url: "http://localhost:8126".to_string(),
            status: None,
            message: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Request to http://localhost:8126 failed: connection refused"
        );
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_serde_error_maps_to_serialization() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: ReporterError = parse.unwrap_err().into();
        assert!(matches!(err, ReporterError::Serialization(_)));
    }
}
