//! Background delivery of payloads to the collector.
//!
//! [`Reporter::report`] only enqueues: it never waits, never fails, and never
//! applies backpressure. A worker drains the bounded queue, assembles each
//! payload on the blocking pool, serializes it once, and tries it against the
//! collector endpoints in rotation, one bounded attempt per endpoint. Payloads
//! that cannot be queued or delivered are dropped and counted.

use crate::config::DeliverySettings;
use crate::error::DeliveryError;
use crate::payload::TelemetryPayload;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Semaphore};

/// Work that becomes a payload on the worker, off the request path.
pub trait PayloadSource: Send + 'static {
    /// Assemble the payload. May run user code and block.
    fn into_payload(self: Box<Self>) -> TelemetryPayload;
}

impl PayloadSource for TelemetryPayload {
    fn into_payload(self: Box<Self>) -> TelemetryPayload {
        *self
    }
}

/// Sends one serialized payload to one endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// POST `body` to `endpoint`, authenticating with `api_key`.
    async fn send(&self, endpoint: &str, api_key: &str, body: Bytes) -> Result<(), DeliveryError>;
}

/// `reqwest`-backed transport.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport whose client gives up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rustapi-treblle/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "Falling back to default HTTP client for Treblle");
                reqwest::Client::new()
            });
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: &str, api_key: &str, body: Bytes) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(endpoint)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header("x-api-key", api_key)
            .body(body)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status {
                endpoint: endpoint.to_string(),
                status: response.status().as_u16(),
            })
        }
    }
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct ReporterStats {
    queued: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`ReporterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReporterMetrics {
    /// Payloads accepted into the queue.
    pub queued: u64,
    /// Payloads rejected because the queue was full or closed.
    pub dropped: u64,
    /// Payloads a collector accepted.
    pub delivered: u64,
    /// Payloads that failed on every attempt.
    pub failed: u64,
}

impl ReporterStats {
    /// Read all counters.
    pub fn snapshot(&self) -> ReporterMetrics {
        ReporterMetrics {
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the background delivery worker.
///
/// Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::Sender<Box<dyn PayloadSource>>,
    stats: Arc<ReporterStats>,
    shutdown: watch::Sender<bool>,
    finished: watch::Receiver<bool>,
}

impl Reporter {
    /// Start a reporter that delivers over HTTP.
    pub fn spawn(delivery: DeliverySettings) -> Self {
        let transport = HttpTransport::new(delivery.timeout);
        Self::with_transport(delivery, transport)
    }

    /// Start a reporter with a custom transport.
    ///
    /// Inside a Tokio runtime the worker becomes a task on that runtime;
    /// otherwise it gets a dedicated thread with its own runtime.
    pub fn with_transport<T: Transport>(delivery: DeliverySettings, transport: T) -> Self {
        let (tx, rx) = mpsc::channel(delivery.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);
        let stats = Arc::new(ReporterStats::default());

        let worker = Worker {
            rx,
            transport: Arc::new(transport),
            delivery,
            stats: stats.clone(),
            shutdown: shutdown_rx,
            finished: finished_tx,
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(worker.run());
            }
            Err(_) => {
                let spawned = std::thread::Builder::new()
                    .name("treblle-reporter".to_string())
                    .spawn(move || {
                        match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(runtime) => runtime.block_on(worker.run()),
                            Err(err) => {
                                tracing::error!(error = %err, "Failed to start Treblle reporter runtime")
                            }
                        }
                    });
                if let Err(err) = spawned {
                    tracing::error!(error = %err, "Failed to start Treblle reporter thread");
                }
            }
        }

        Self {
            inner: Arc::new(Inner {
                tx,
                stats,
                shutdown: shutdown_tx,
                finished: finished_rx,
            }),
        }
    }

    /// Queue a payload for delivery.
    ///
    /// Returns immediately. A full or closed queue drops the payload.
    pub fn report(&self, payload: TelemetryPayload) {
        self.report_with(payload);
    }

    /// Queue deferred work; the worker assembles the payload before sending.
    ///
    /// Same drop rules as [`Reporter::report`].
    pub fn report_with<S: PayloadSource>(&self, source: S) {
        match self.inner.tx.try_send(Box::new(source)) {
            Ok(()) => {
                self.inner.stats.queued.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Treblle payload queued");
            }
            Err(TrySendError::Full(_)) => {
                self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Treblle delivery queue full, dropping payload");
            }
            Err(TrySendError::Closed(_)) => {
                self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Treblle reporter stopped, dropping payload");
            }
        }
    }

    /// Current counters.
    pub fn metrics(&self) -> ReporterMetrics {
        self.inner.stats.snapshot()
    }

    /// Stop accepting payloads and wait up to `grace` for queued and
    /// in-flight deliveries.
    ///
    /// Returns `true` if the worker finished in time. Whatever is still
    /// pending afterwards is abandoned.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let _ = self.inner.shutdown.send(true);
        let mut finished = self.inner.finished.clone();
        let wait = async move {
            loop {
                if *finished.borrow_and_update() {
                    return true;
                }
                if finished.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(grace, wait).await.unwrap_or(false)
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("metrics", &self.metrics())
            .finish()
    }
}

struct Worker {
    rx: mpsc::Receiver<Box<dyn PayloadSource>>,
    transport: Arc<dyn Transport>,
    delivery: DeliverySettings,
    stats: Arc<ReporterStats>,
    shutdown: watch::Receiver<bool>,
    finished: watch::Sender<bool>,
}

impl Worker {
    async fn run(mut self) {
        let permits = self.delivery.max_concurrent_deliveries;
        let semaphore = Arc::new(Semaphore::new(permits));
        let delivery = Arc::new(Delivery {
            transport: self.transport.clone(),
            endpoints: self.delivery.endpoints.clone(),
            timeout: self.delivery.timeout,
            max_attempts: self.delivery.max_attempts,
            cursor: AtomicUsize::new(0),
            stats: self.stats.clone(),
        });

        loop {
            let payload = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                payload = self.rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let delivery = delivery.clone();
            tokio::spawn(async move {
                delivery.deliver(payload).await;
                drop(permit);
            });
        }

        // Drain whatever was queued before intake stopped.
        self.rx.close();
        while let Ok(payload) = self.rx.try_recv() {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let delivery = delivery.clone();
            tokio::spawn(async move {
                delivery.deliver(payload).await;
                drop(permit);
            });
        }

        let all = u32::try_from(permits).unwrap_or(u32::MAX);
        let _ = semaphore.acquire_many(all).await;
        let _ = self.finished.send(true);
        tracing::debug!("Treblle reporter stopped");
    }
}

struct Delivery {
    transport: Arc<dyn Transport>,
    endpoints: Vec<String>,
    timeout: Duration,
    max_attempts: usize,
    cursor: AtomicUsize,
    stats: Arc<ReporterStats>,
}

impl Delivery {
    async fn deliver(&self, source: Box<dyn PayloadSource>) {
        let payload = match tokio::task::spawn_blocking(move || source.into_payload()).await {
            Ok(payload) => payload,
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %err, "Failed to build Treblle payload");
                return;
            }
        };

        match self.try_deliver(&payload).await {
            Ok(endpoint) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(endpoint = %endpoint, "Treblle payload delivered");
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "Dropping Treblle payload");
            }
        }
    }

    /// Try successive endpoints, starting one past the previous payload's
    /// starting point, until one accepts or the attempt budget is spent.
    async fn try_deliver(&self, payload: &TelemetryPayload) -> Result<&str, DeliveryError> {
        let body = Bytes::from(serde_json::to_vec(payload)?);
        let count = self.endpoints.len();
        let attempts = self.max_attempts.min(count);
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        for attempt in 0..attempts {
            let endpoint = self.endpoints[(start + attempt) % count].as_str();
            let sent = tokio::time::timeout(
                self.timeout,
                self.transport.send(endpoint, &payload.api_key, body.clone()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(DeliveryError::Timeout {
                    endpoint: endpoint.to_string(),
                })
            });

            match sent {
                Ok(()) => return Ok(endpoint),
                Err(err) => {
                    tracing::debug!(endpoint = %endpoint, attempt = attempt + 1, error = %err, "Treblle delivery attempt failed");
                }
            }
        }

        Err(DeliveryError::Exhausted { attempts })
    }
}
