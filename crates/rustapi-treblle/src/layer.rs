//! The Treblle middleware layer.
//!
//! Wraps the application handler, snapshots the exchange, and hands the
//! snapshots to the [`Reporter`], which transforms, masks and builds the
//! payload off the request path. The handler's response or error is always
//! returned as the handler produced it.

use crate::capture::{CaptureContext, ResponseSnapshot};
use crate::config::{Settings, TreblleConfig};
use crate::error::{Result, Side};
use crate::limiter::{CapturedBody, OmissionReason};
use crate::masking::MaskingPolicy;
use crate::middleware::{BoxFuture, BoxedNext, MiddlewareLayer, Request};
use crate::payload::{ErrorEntry, PayloadBuilder, TelemetryPayload};
use crate::reporter::{PayloadSource, Reporter};
use crate::transform::{panic_message, Transformer};
use futures_util::FutureExt;
use serde_json::Value;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Middleware that reports every exchange to Treblle.
///
/// # Example
///
/// ```ignore
/// use rustapi_treblle::{TreblleConfig, TreblleLayer};
///
/// let treblle = TreblleLayer::from_config(
///     TreblleConfig::new()
///         .api_key("...")
///         .project_id("...")
///         .skip_path("/health"),
/// )?;
///
/// let app = RustApi::new()
///     .layer(treblle)
///     .route("/api", get(handler));
/// ```
#[derive(Clone)]
pub struct TreblleLayer {
    settings: Arc<Settings>,
    builder: Arc<PayloadBuilder>,
    reporter: Reporter,
}

impl TreblleLayer {
    /// Create a layer with its own HTTP reporter.
    pub fn new(settings: Settings) -> Self {
        let reporter = Reporter::spawn(settings.delivery().clone());
        Self::with_reporter(settings, reporter)
    }

    /// Resolve a configuration and create a layer.
    pub fn from_config(config: TreblleConfig) -> Result<Self> {
        Ok(Self::new(config.resolve()?))
    }

    /// Create a layer configured only from `TREBLLE_*` variables.
    pub fn from_env() -> Result<Self> {
        Self::from_config(TreblleConfig::new())
    }

    /// Create a layer that reports through an existing reporter.
    pub fn with_reporter(settings: Settings, reporter: Reporter) -> Self {
        tracing::info!(
            project_id = %settings.project_id(),
            endpoints = settings.delivery().endpoints.len(),
            body_limit = settings.body_limit().limit(),
            "Treblle middleware enabled"
        );
        let builder = PayloadBuilder::new(&settings);
        Self {
            settings: Arc::new(settings),
            builder: Arc::new(builder),
            reporter,
        }
    }

    /// The reporter payloads are queued on.
    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// The resolved settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

impl std::fmt::Debug for TreblleLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreblleLayer")
            .field("settings", &self.settings)
            .field("reporter", &self.reporter)
            .finish()
    }
}

impl MiddlewareLayer for TreblleLayer {
    fn call(&self, req: Request, next: BoxedNext) -> BoxFuture {
        let settings = self.settings.clone();
        let builder = self.builder.clone();
        let reporter = self.reporter.clone();

        Box::pin(async move {
            if settings.should_skip_path(req.path()) {
                return next(req).await;
            }

            let ctx = CaptureContext::capture(&req, settings.body_limit());
            let outcome = AssertUnwindSafe(async move { next(req).await })
                .catch_unwind()
                .await;

            let mut exchange = Exchange {
                settings: settings.clone(),
                builder,
                ctx,
                response: None,
                errors: Vec::new(),
            };

            match outcome {
                Ok(Ok(response)) => {
                    let (response, snapshot) =
                        ResponseSnapshot::capture(response, settings.body_limit()).await;
                    exchange.response = Some(snapshot);
                    reporter.report_with(exchange);
                    Ok(response)
                }
                Ok(Err(err)) => {
                    exchange.errors.push(ErrorEntry::new("HandlerError", err.to_string()));
                    reporter.report_with(exchange);
                    Err(err)
                }
                Err(panic) => {
                    exchange
                        .errors
                        .push(ErrorEntry::new("HandlerPanic", panic_message(panic.as_ref())));
                    reporter.report_with(exchange);
                    resume_unwind(panic)
                }
            }
        })
    }

    fn clone_box(&self) -> Box<dyn MiddlewareLayer> {
        Box::new(self.clone())
    }
}

/// Snapshots of one exchange, turned into a payload by the reporter worker.
///
/// Transformers, masking and payload assembly run there, off the request
/// path.
struct Exchange {
    settings: Arc<Settings>,
    builder: Arc<PayloadBuilder>,
    ctx: CaptureContext,
    response: Option<ResponseSnapshot>,
    errors: Vec<ErrorEntry>,
}

impl PayloadSource for Exchange {
    fn into_payload(self: Box<Self>) -> TelemetryPayload {
        let Exchange {
            settings,
            builder,
            ctx,
            response,
            mut errors,
        } = *self;

        // Request-side failures are listed ahead of the handler outcome.
        let mut body_errors = Vec::new();
        let request_body = body_value(
            &ctx.body,
            &settings.request_transformer,
            settings.masking(),
            Side::Request,
            &mut body_errors,
        );
        let response_body = response.as_ref().map(|snapshot| {
            body_value(
                &snapshot.body,
                &settings.response_transformer,
                settings.masking(),
                Side::Response,
                &mut body_errors,
            )
        });
        body_errors.append(&mut errors);

        builder.build(&ctx, response.as_ref().zip(response_body), request_body, body_errors)
    }
}

/// Transform then mask a captured body, or produce its omission marker.
fn body_value(
    body: &CapturedBody,
    transformer: &Transformer,
    masking: &MaskingPolicy,
    side: Side,
    errors: &mut Vec<ErrorEntry>,
) -> Value {
    match body {
        CapturedBody::Omitted { reason, .. } => reason.marker(),
        CapturedBody::Captured(bytes) => match transformer.apply(side, bytes) {
            Ok(value) => masking.mask_value(&value),
            Err(err) => {
                tracing::warn!(error = %err, "Treblle body transform failed");
                errors.push(ErrorEntry::from(&err));
                OmissionReason::TransformFailed.marker()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::middleware::{handler_fn, HandlerError, StreamingResponse};
    use crate::reporter::Transport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collected {
        payloads: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Transport for Arc<Collected> {
        async fn send(&self, _endpoint: &str, _api_key: &str, body: Bytes) -> std::result::Result<(), DeliveryError> {
            self.payloads.lock().unwrap().push(serde_json::from_slice(&body)?);
            Ok(())
        }
    }

    fn config() -> TreblleConfig {
        TreblleConfig::new()
            .api_key("test-key")
            .project_id("test-project")
            .endpoints(["http://collector.test"])
    }

    fn layer(config: TreblleConfig) -> (TreblleLayer, Arc<Collected>) {
        let settings = config.resolve_from_vars(Vec::<(String, String)>::new()).unwrap();
        let collected = Arc::new(Collected::default());
        let reporter = Reporter::with_transport(settings.delivery().clone(), collected.clone());
        (TreblleLayer::with_reporter(settings, reporter), collected)
    }

    async fn flush(layer: &TreblleLayer, collected: &Collected) -> Vec<Value> {
        assert!(layer.reporter().shutdown(Duration::from_secs(2)).await);
        collected.payloads.lock().unwrap().clone()
    }

    fn login_request() -> Request {
        Request::from_http(
            http::Request::builder()
                .method("POST")
                .uri("/login")
                .header("host", "api.example.com")
                .header("authorization", "Bearer secret-token")
                .header("content-type", "application/json")
                .body(Bytes::from_static(br#"{"user":"alice","password":"hunter2"}"#))
                .unwrap(),
        )
    }

    fn json_handler(body: &'static str) -> BoxedNext {
        handler_fn(move |_req: Request| async move {
            Ok(http::Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from_static(body.as_bytes())))
                .unwrap())
        })
    }

    #[tokio::test]
    async fn test_exchange_is_masked_and_reported() {
        let (layer, collected) = layer(config());
        let next = json_handler(r#"{"token":"abc","id":7}"#);

        let response = layer.call(login_request(), next).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), br#"{"token":"abc","id":7}"#);

        let payloads = flush(&layer, &collected).await;
        assert_eq!(payloads.len(), 1);
        let data = &payloads[0]["data"];
        assert_eq!(payloads[0]["api_key"], "test-key");
        assert_eq!(data["request"]["body"], json!({"user": "alice", "password": "*****"}));
        assert_eq!(data["request"]["headers"]["authorization"], "Bearer ************");
        assert_eq!(data["response"]["body"], json!({"token": "*****", "id": 7}));
        assert_eq!(data["response"]["code"], 200);
        assert_eq!(data["errors"], json!([]));
    }

    #[tokio::test]
    async fn test_skipped_path_is_not_reported() {
        let (layer, collected) = layer(config().skip_path("/health"));
        let req = Request::from_http(http::Request::builder().uri("/health").body(Bytes::new()).unwrap());

        let response = layer.call(req, json_handler("{}")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(flush(&layer, &collected).await.is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_passes_through() {
        let (layer, collected) = layer(config());
        let next = handler_fn(|_req: Request| async move {
            Err::<crate::middleware::Response, HandlerError>("database unavailable".into())
        });

        let err = layer.call(login_request(), next).await.unwrap_err();
        assert_eq!(err.to_string(), "database unavailable");

        let payloads = flush(&layer, &collected).await;
        let data = &payloads[0]["data"];
        assert_eq!(data["errors"][0]["type"], "HandlerError");
        assert_eq!(data["errors"][0]["message"], "database unavailable");
        assert_eq!(data["response"], json!({"omitted": true, "reason": "not_available"}));
    }

    #[tokio::test]
    async fn test_handler_panic_is_reported_and_resumed() {
        let (layer, collected) = layer(config());
        let next = handler_fn(|_req: Request| async move {
            if true {
                panic!("handler exploded");
            }
            Ok(http::Response::new(Full::new(Bytes::new())))
        });

        let outcome = AssertUnwindSafe(layer.call(login_request(), next))
            .catch_unwind()
            .await;
        assert!(outcome.is_err());

        let payloads = flush(&layer, &collected).await;
        assert_eq!(payloads[0]["data"]["errors"][0]["type"], "HandlerPanic");
        assert_eq!(payloads[0]["data"]["errors"][0]["message"], "handler exploded");
    }

    #[tokio::test]
    async fn test_failing_transformer_is_recorded() {
        let (layer, collected) = layer(config().request_transformer(|_: &Bytes| {
            Err::<Value, crate::transform::TransformError>("bad input".into())
        }));

        let response = layer.call(login_request(), json_handler("{}")).await.unwrap();
        assert_eq!(response.status(), 200);

        let payloads = flush(&layer, &collected).await;
        let data = &payloads[0]["data"];
        assert_eq!(data["request"]["body"], json!({"omitted": true, "reason": "transform_failed"}));
        assert_eq!(data["errors"][0]["type"], "TransformError");
    }

    #[tokio::test]
    async fn test_slow_transformer_does_not_delay_handler_error() {
        let (layer, collected) = layer(config().request_transformer(|_: &Bytes| {
            std::thread::sleep(Duration::from_millis(400));
            Ok::<Value, crate::transform::TransformError>(json!({"slow": true}))
        }));
        let next = handler_fn(|_req: Request| async move {
            Err::<crate::middleware::Response, HandlerError>("upstream refused".into())
        });

        let started = std::time::Instant::now();
        let err = layer.call(login_request(), next).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(err.to_string(), "upstream refused");

        let payloads = flush(&layer, &collected).await;
        let data = &payloads[0]["data"];
        assert_eq!(data["request"]["body"], json!({"slow": true}));
        assert_eq!(data["errors"][0]["type"], "HandlerError");
    }

    #[tokio::test]
    async fn test_slow_transformer_does_not_delay_response() {
        let (layer, collected) = layer(config().response_transformer(|_: &Bytes| {
            std::thread::sleep(Duration::from_millis(400));
            Ok::<Value, crate::transform::TransformError>(json!({}))
        }));

        let started = std::time::Instant::now();
        let response = layer.call(login_request(), json_handler("{}")).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(response.status(), 200);

        assert_eq!(flush(&layer, &collected).await.len(), 1);
    }

    #[tokio::test]
    async fn test_transformer_output_is_masked() {
        let (layer, collected) = layer(config().response_transformer(|_: &Bytes| {
            Ok::<Value, crate::transform::TransformError>(json!({"session": {"api_key": "k-123"}}))
        }));

        layer.call(login_request(), json_handler("{}")).await.unwrap();

        let payloads = flush(&layer, &collected).await;
        assert_eq!(
            payloads[0]["data"]["response"]["body"],
            json!({"session": {"api_key": "*****"}})
        );
    }

    #[tokio::test]
    async fn test_streaming_response_skips_transformer() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let (layer, collected) = layer(config().response_transformer(|_: &Bytes| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok::<Value, crate::transform::TransformError>(json!({}))
        }));
        let next = handler_fn(|_req: Request| async move {
            let mut response = http::Response::new(Full::new(Bytes::from_static(b"data: 1\n\n")));
            response.extensions_mut().insert(StreamingResponse);
            Ok(response)
        });

        let response = layer.call(login_request(), next).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"data: 1\n\n");
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);

        let payloads = flush(&layer, &collected).await;
        assert_eq!(
            payloads[0]["data"]["response"]["body"],
            json!({"omitted": true, "reason": "streaming_response"})
        );
    }

    #[tokio::test]
    async fn test_oversized_request_body_marker() {
        let (layer, collected) = layer(config().limit_request_body_size(8));

        layer.call(login_request(), json_handler("{}")).await.unwrap();

        let payloads = flush(&layer, &collected).await;
        assert_eq!(
            payloads[0]["data"]["request"]["body"],
            json!({"omitted": true, "reason": "size_limit_exceeded"})
        );
        assert_eq!(payloads[0]["data"]["response"]["body"], json!({}));
    }
}
