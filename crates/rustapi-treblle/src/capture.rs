//! Per-request snapshots.
//!
//! A [`CaptureContext`] is taken before the handler runs and a
//! [`ResponseSnapshot`] after it returns. Both are owned by the single
//! request they describe and dropped once the payload is built.

use crate::limiter::{declared_length, BodyLimit, CapturedBody, OmissionReason};
use crate::middleware::{Request, Response, StreamingResponse};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::response::Parts;
use http::HeaderMap;
use http_body::Body as _;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

/// Request metadata and body captured at request start.
#[derive(Debug, Clone)]
pub struct CaptureContext {
    /// HTTP method.
    pub method: String,
    /// Full request URL.
    pub url: String,
    /// Path without query.
    pub path: String,
    /// Raw query string.
    pub query: Option<String>,
    /// Client address.
    pub client_ip: String,
    /// `User-Agent`, or empty.
    pub user_agent: String,
    /// `HTTP/1.1`, `HTTP/2.0`, ...
    pub protocol: String,
    /// Unmasked request headers.
    pub headers: HeaderMap,
    /// Request body after the size check.
    pub body: CapturedBody,
    /// Wall-clock start, for the payload timestamp.
    pub timestamp: DateTime<Utc>,
    /// Monotonic start, for load time.
    pub started_at: Instant,
}

impl CaptureContext {
    /// Snapshot an inbound request.
    ///
    /// The body is limited before anything else looks at it.
    pub fn capture(req: &Request, limit: BodyLimit) -> Self {
        let headers = req.headers().clone();
        let body = limit.check(req.body(), declared_length(&headers));

        Self {
            method: req.method().to_string(),
            url: full_url(req),
            path: req.path().to_string(),
            query: req.query_string().map(str::to_string),
            client_ip: client_ip(req),
            user_agent: header_str(&headers, http::header::USER_AGENT).unwrap_or_default(),
            protocol: format!("{:?}", req.version()),
            headers,
            body,
            timestamp: Utc::now(),
            started_at: Instant::now(),
        }
    }
}

/// Response metadata and body captured after the handler returns.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    /// Status code.
    pub status: u16,
    /// Unmasked response headers.
    pub headers: HeaderMap,
    /// Response body after the streaming and size checks.
    pub body: CapturedBody,
    /// Reported body size.
    pub size: usize,
    /// Whether the body was treated as a stream.
    pub streaming: bool,
    /// Monotonic end.
    pub finished_at: Instant,
}

impl ResponseSnapshot {
    /// Snapshot a response and hand back an equivalent one.
    ///
    /// The returned response has the same parts and the same bytes as the
    /// input. Streaming bodies and bodies with an exact size above the
    /// limit are passed through without being read.
    pub async fn capture(response: Response, limit: BodyLimit) -> (Response, Self) {
        let finished_at = Instant::now();
        let (parts, body) = response.into_parts();
        let status = parts.status.as_u16();
        let headers = parts.headers.clone();

        if is_streaming(&parts) {
            let snapshot = Self {
                status,
                headers,
                body: CapturedBody::omitted(OmissionReason::StreamingResponse, None),
                size: 0,
                streaming: true,
                finished_at,
            };
            return (http::Response::from_parts(parts, body), snapshot);
        }

        let size_hint = body.size_hint().exact().map(|n| usize::try_from(n).unwrap_or(usize::MAX));
        let declared = declared_length(&headers).or(size_hint);
        if let Some(size) = declared.filter(|size| *size > limit.limit()) {
            let snapshot = Self {
                status,
                headers,
                body: CapturedBody::omitted(OmissionReason::SizeLimitExceeded, Some(size)),
                size,
                streaming: false,
                finished_at,
            };
            return (http::Response::from_parts(parts, body), snapshot);
        }

        let bytes = collect_full(body).await;
        let captured = limit.check(&bytes, None);
        let snapshot = Self {
            status,
            headers,
            size: bytes.len(),
            body: captured,
            streaming: false,
            finished_at,
        };
        (http::Response::from_parts(parts, Full::new(bytes)), snapshot)
    }
}

async fn collect_full(body: Full<Bytes>) -> Bytes {
    match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(never) => match never {},
    }
}

/// Chunked transfer encoding or an explicit host marker.
pub fn is_streaming(parts: &Parts) -> bool {
    if parts.extensions.get::<StreamingResponse>().is_some() {
        return true;
    }
    parts
        .headers
        .get_all(http::header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|enc| enc.trim().eq_ignore_ascii_case("chunked")))
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

/// Client address: `X-Forwarded-For`, then `X-Real-IP`, then the peer.
pub fn client_ip(req: &Request) -> String {
    let forwarded = header_str(req.headers(), http::header::HeaderName::from_static("x-forwarded-for"))
        .and_then(|v| v.split(',').next().map(|first| first.trim().to_string()));
    let real_ip = header_str(req.headers(), http::header::HeaderName::from_static("x-real-ip"));

    forwarded
        .into_iter()
        .chain(real_ip)
        .find(|candidate| candidate.parse::<IpAddr>().is_ok())
        .or_else(|| req.remote_addr().map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// `{scheme}://{host}{path?query}`, or just the path when no host is known.
pub fn full_url(req: &Request) -> String {
    let uri = req.uri();
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let host = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| header_str(req.headers(), http::header::HOST));
    let Some(host) = host else {
        return path_and_query.to_string();
    };

    let scheme = header_str(req.headers(), http::header::HeaderName::from_static("x-forwarded-proto"))
        .or_else(|| uri.scheme_str().map(str::to_string))
        .unwrap_or_else(|| "http".to_string());

    format!("{scheme}://{host}{path_and_query}")
}
