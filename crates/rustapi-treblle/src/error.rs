//! Error types for the Treblle integration.
//!
//! Only [`ConfigError`] is ever returned to the application. Capture and
//! delivery failures are recorded or logged and never reach the host's
//! request path.

use std::fmt;
use thiserror::Error;

/// Which side of the exchange a capture failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The inbound request.
    Request,
    /// The outbound response.
    Response,
}

impl Side {
    /// Lowercase name, used in log fields and error entries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Request => "request",
            Side::Response => "response",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration could not be resolved.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No API key was passed and `TREBLLE_API_KEY` is unset.
    #[error("Treblle API key is required (pass it explicitly or set TREBLLE_API_KEY)")]
    MissingApiKey,

    /// No project id was passed and `TREBLLE_PROJECT_ID` is unset.
    #[error("Treblle project id is required (pass it explicitly or set TREBLLE_PROJECT_ID)")]
    MissingProjectId,

    /// Environment variables could not be deserialized.
    #[error("Configuration error: {0}")]
    Env(#[from] envy::Error),

    /// A `.env` file could not be loaded.
    #[error("Failed to load .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),

    /// A collector endpoint is not an absolute http(s) URL.
    #[error("Invalid collector endpoint {url:?}: {reason}")]
    InvalidEndpoint {
        /// The offending value.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The endpoint list is empty.
    #[error("At least one collector endpoint is required")]
    NoEndpoints,

    /// A size, timeout, or capacity setting is zero.
    #[error("Invalid value for {0}: must be greater than zero")]
    InvalidLimit(&'static str),
}

/// A failure while snapshotting or transforming a body.
///
/// Recovered locally and recorded in the payload's error list.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// A user-supplied transformer returned an error.
    #[error("{side} transformer failed: {message}")]
    Transform {
        /// Which transformer failed.
        side: Side,
        /// The transformer's error message.
        message: String,
    },

    /// A user-supplied transformer panicked.
    #[error("{side} transformer panicked: {message}")]
    TransformPanicked {
        /// Which transformer panicked.
        side: Side,
        /// The panic message, when it was a string.
        message: String,
    },
}

impl CaptureError {
    /// Short machine-readable type name, used as the error entry `type`.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::Transform { .. } => "TransformError",
            CaptureError::TransformPanicked { .. } => "TransformPanic",
        }
    }
}

/// A failure while delivering a payload to the collector.
///
/// Logged and counted by the reporter, never surfaced to the application.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The attempt did not finish within the configured timeout.
    #[error("Request to {endpoint} timed out")]
    Timeout {
        /// The endpoint that did not answer.
        endpoint: String,
    },

    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The collector answered with a non-success status.
    #[error("Collector {endpoint} returned status {status}")]
    Status {
        /// The endpoint that answered.
        endpoint: String,
        /// The returned status code.
        status: u16,
    },

    /// The payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Every attempt failed.
    #[error("Delivery failed after {attempts} attempt(s)")]
    Exhausted {
        /// How many endpoints were tried.
        attempts: usize,
    },
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_error_kind() {
        let err = CaptureError::Transform {
            side: Side::Request,
            message: "boom".to_string(),
        };
        assert_eq!(err.kind(), "TransformError");
        assert_eq!(err.to_string(), "request transformer failed: boom");

        let err = CaptureError::TransformPanicked {
            side: Side::Response,
            message: "oops".to_string(),
        };
        assert_eq!(err.kind(), "TransformPanic");
    }

    #[test]
    fn test_config_error_messages_do_not_leak_values() {
        let msg = ConfigError::MissingApiKey.to_string();
        assert!(msg.contains("TREBLLE_API_KEY"));

        let msg = ConfigError::InvalidLimit("queue_capacity").to_string();
        assert!(msg.contains("queue_capacity"));
    }
}
