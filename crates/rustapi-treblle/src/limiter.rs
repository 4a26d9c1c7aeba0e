//! Body size ceiling for captured bodies.
//!
//! Oversized bodies never enter the transform/mask pipeline. They are
//! represented by an omission marker instead of a truncated prefix.

use bytes::Bytes;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Default ceiling: 4 MiB.
pub const DEFAULT_BODY_LIMIT: usize = 4 * 1024 * 1024;

/// Why a body was not captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OmissionReason {
    /// Larger than the configured ceiling.
    SizeLimitExceeded,
    /// A streaming response; reading it would block or buffer unboundedly.
    StreamingResponse,
    /// The transformer failed for this body.
    TransformFailed,
    /// The source was never produced (e.g. the handler failed).
    NotAvailable,
}

impl OmissionReason {
    /// The marker placed in the payload for this reason.
    pub fn marker(self) -> Value {
        json!({ "omitted": true, "reason": self })
    }
}

/// A body after the limiter has looked at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturedBody {
    /// Within the limit; the raw bytes.
    Captured(Bytes),
    /// Not captured.
    Omitted {
        /// Why.
        reason: OmissionReason,
        /// Size of the body when it is known.
        size: Option<usize>,
    },
}

impl CapturedBody {
    /// Shorthand for an omitted body.
    pub fn omitted(reason: OmissionReason, size: Option<usize>) -> Self {
        CapturedBody::Omitted { reason, size }
    }

    /// The captured bytes, if any.
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            CapturedBody::Captured(bytes) => Some(bytes),
            CapturedBody::Omitted { .. } => None,
        }
    }

    /// Size of the underlying body, if known.
    pub fn size(&self) -> Option<usize> {
        match self {
            CapturedBody::Captured(bytes) => Some(bytes.len()),
            CapturedBody::Omitted { size, .. } => *size,
        }
    }
}

/// A size ceiling for one side of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyLimit {
    limit: usize,
}

impl Default for BodyLimit {
    fn default() -> Self {
        Self::new(DEFAULT_BODY_LIMIT)
    }
}

impl BodyLimit {
    /// Create a limiter with the given ceiling in bytes.
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    /// The ceiling in bytes.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Decide on an already-buffered body.
    ///
    /// A declared length is trusted first, so a body announced as too large
    /// is rejected without looking at the bytes.
    pub fn check(&self, body: &Bytes, declared_len: Option<usize>) -> CapturedBody {
        if let Some(declared) = declared_len {
            if declared > self.limit {
                return CapturedBody::omitted(OmissionReason::SizeLimitExceeded, Some(declared));
            }
        }
        if body.len() > self.limit {
            return CapturedBody::omitted(OmissionReason::SizeLimitExceeded, Some(body.len()));
        }
        CapturedBody::Captured(body.clone())
    }
}

/// Parse a `Content-Length` header, if present and valid.
pub fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<usize>().ok())
}
