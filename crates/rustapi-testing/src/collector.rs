use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};

type GenericError = Box<dyn std::error::Error + Send + Sync>;

/// How the collector answers ingestion requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answer every request with this status.
    Respond(StatusCode),
    /// Record the request, then never answer.
    Stall,
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior::Respond(StatusCode::OK)
    }
}

/// One ingestion request as the collector saw it.
#[derive(Debug, Clone)]
pub struct ReceivedPayload {
    pub method: http::Method,
    pub path: String,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

impl ReceivedPayload {
    /// Body parsed as JSON, or `Null` if it is not JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }

    /// The `X-API-Key` header, if sent.
    pub fn api_key(&self) -> Option<&str> {
        self.headers.get("x-api-key").and_then(|v| v.to_str().ok())
    }
}

struct CollectorState {
    behavior: Behavior,
    received: Vec<ReceivedPayload>,
}

struct Shared {
    state: Mutex<CollectorState>,
    arrived: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An in-process stand-in for the Treblle collector.
///
/// Listens on a random local port and records every request it receives.
pub struct MockCollector {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockCollector {
    /// Start a collector that answers `200 OK`.
    pub async fn start() -> std::io::Result<Self> {
        Self::with_behavior(Behavior::default()).await
    }

    /// Start a collector with the given behavior.
    pub async fn with_behavior(behavior: Behavior) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(CollectorState {
                behavior,
                received: Vec::new(),
            }),
            arrived: Notify::new(),
        });

        let shared_clone = shared.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut stop_future = shutdown_rx;

            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let shared = shared_clone.clone();

                                tokio::spawn(async move {
                                    if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                                        .serve_connection(io, service_fn(move |req| handle_request(req, shared.clone())))
                                        .await
                                    {
                                        tracing::debug!(error = %err, "Mock collector connection closed");
                                    }
                                });
                            }
                            Err(e) => tracing::debug!(error = %e, "Mock collector accept error"),
                        }
                    }
                    _ = &mut stop_future => {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            shared,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Base URL of the collector, e.g. `http://127.0.0.1:41234`.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Change how later requests are answered.
    pub fn set_behavior(&self, behavior: Behavior) {
        self.shared.lock().behavior = behavior;
    }

    /// Everything received so far, including stalled requests.
    pub fn received(&self) -> Vec<ReceivedPayload> {
        self.shared.lock().received.clone()
    }

    /// Number of requests received so far.
    pub fn hits(&self) -> usize {
        self.shared.lock().received.len()
    }

    /// Wait until at least `count` requests have arrived or `timeout`
    /// passes, then return what was received.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<ReceivedPayload> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.arrived.notified();
            if self.hits() >= count {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        self.received()
    }
}

impl Drop for MockCollector {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    shared: Arc<Shared>,
) -> Result<Response<Full<Bytes>>, GenericError> {
    let (parts, body) = req.into_parts();
    let body_bytes = body.collect().await?.to_bytes();

    let behavior = {
        let mut state = shared.lock();
        state.received.push(ReceivedPayload {
            method: parts.method,
            path: parts.uri.path().to_string(),
            headers: parts.headers,
            body: body_bytes,
        });
        state.behavior
    };
    shared.arrived.notify_waiters();

    match behavior {
        Behavior::Respond(status) => Ok(Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from_static(b"{}")))?),
        Behavior::Stall => std::future::pending().await,
    }
}
