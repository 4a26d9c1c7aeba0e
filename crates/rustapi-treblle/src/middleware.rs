//! Host integration surface.
//!
//! The host framework hands the middleware a [`Request`] whose body has
//! already been buffered, and a [`BoxedNext`] that runs the rest of the
//! chain. Handler failures travel as `Err(HandlerError)`; the middleware
//! returns them untouched.

use bytes::Bytes;
use http::{request::Parts, Extensions, HeaderMap, Method, Uri, Version};
use http_body_util::Full;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

/// Response type exchanged with the host.
pub type Response = http::Response<Full<Bytes>>;

/// Error raised by the wrapped application handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of the wrapped handler.
pub type HandlerResult = Result<Response, HandlerError>;

/// Future returned by middleware and handlers.
pub type BoxFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'static>>;

/// The next step of the middleware chain.
pub type BoxedNext = Arc<dyn Fn(Request) -> BoxFuture + Send + Sync>;

/// Trait for middleware that wraps a request/response cycle.
pub trait MiddlewareLayer: Send + Sync + 'static {
    /// Apply this middleware to a request, calling `next` to continue the chain
    fn call(&self, req: Request, next: BoxedNext) -> BoxFuture;

    /// Clone this middleware into a boxed trait object
    fn clone_box(&self) -> Box<dyn MiddlewareLayer>;
}

impl Clone for Box<dyn MiddlewareLayer> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Marks a response as streaming.
///
/// Hosts insert this into the response extensions when the body is produced
/// incrementally. Such bodies are never read or transformed for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingResponse;

/// An inbound request with its body already buffered.
#[derive(Debug)]
pub struct Request {
    parts: Parts,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
}

impl Request {
    /// Create a request from its parts and buffered body.
    pub fn new(parts: Parts, body: Bytes) -> Self {
        Self {
            parts,
            body,
            remote_addr: None,
        }
    }

    /// Build from an `http::Request` with a buffered body.
    pub fn from_http(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self::new(parts, body)
    }

    /// Attach the peer address of the connection.
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Get the HTTP method
    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    /// Get the URI
    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    /// Get the HTTP version
    pub fn version(&self) -> Version {
        self.parts.version
    }

    /// Get the headers
    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Get request extensions
    pub fn extensions(&self) -> &Extensions {
        &self.parts.extensions
    }

    /// Get the request path
    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    /// Get the query string
    pub fn query_string(&self) -> Option<&str> {
        self.parts.uri.query()
    }

    /// Get the buffered body
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Peer address of the connection, when the host supplied one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Split back into `http` parts and body.
    pub fn into_parts(self) -> (Parts, Bytes) {
        (self.parts, self.body)
    }
}

/// Wrap an async handler function as a [`BoxedNext`].
pub fn handler_fn<F, Fut>(f: F) -> BoxedNext
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)) as BoxFuture)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_accessors() {
        let req = http::Request::builder()
            .method(Method::POST)
            .uri("/users?page=2")
            .header("content-type", "application/json")
            .body(Bytes::from_static(b"{}"))
            .unwrap();
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let req = Request::from_http(req).with_remote_addr(addr);

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.path(), "/users");
        assert_eq!(req.query_string(), Some("page=2"));
        assert_eq!(req.body().as_ref(), b"{}");
        assert_eq!(req.remote_addr(), Some(addr));
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let next = handler_fn(|req: Request| async move {
            let body = req.body().clone();
            Ok(http::Response::new(Full::new(body)))
        });

        let req = Request::from_http(http::Request::new(Bytes::from_static(b"ping")));
        let resp = next(req).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);
    }
}
