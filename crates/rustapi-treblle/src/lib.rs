//! # rustapi-treblle
//!
//! Treblle API observability for the RustAPI framework.
//!
//! [`TreblleLayer`] wraps every request/response exchange, masks sensitive
//! fields, and ships a telemetry payload to the Treblle collector on a
//! background worker. Telemetry never changes what the client receives and
//! never waits on the network.
//!
//! ## Pipeline
//!
//! - [`capture`] - request and response snapshots
//! - [`limiter`] - body size ceiling and omission markers
//! - [`transform`] - body to JSON, with optional user hooks
//! - [`masking`] - hidden keys and Authorization masking
//! - [`payload`] - the collector wire format
//! - [`reporter`] - bounded queue, endpoint rotation, delivery
//!
//! ## Example
//!
//! ```ignore
//! use rustapi_treblle::{config, TreblleConfig, TreblleLayer};
//!
//! config::load_dotenv();
//!
//! let treblle = TreblleLayer::from_config(
//!     TreblleConfig::new()
//!         .hidden_key("iban")
//!         .skip_path("/health"),
//! )?;
//! ```
//!
//! ## Environment
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `TREBLLE_API_KEY` | Collector credential |
//! | `TREBLLE_PROJECT_ID` | Project identifier |
//! | `TREBLLE_HIDDEN_KEYS` | Extra hidden keys, comma separated |
//! | `TREBLLE_MASK_AUTH_HEADER` | `true`/`false` |
//! | `TREBLLE_LIMIT_REQUEST_BODY_SIZE` | Body ceiling in bytes |
//! | `TREBLLE_ENDPOINTS` | Collector URLs, comma separated |

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod capture;
pub mod config;
pub mod error;
pub mod layer;
pub mod limiter;
pub mod masking;
pub mod middleware;
pub mod payload;
pub mod reporter;
pub mod transform;

pub use capture::{CaptureContext, ResponseSnapshot};
pub use config::{DeliverySettings, Settings, TreblleConfig};
pub use error::{CaptureError, ConfigError, DeliveryError, Result, Side};
pub use layer::TreblleLayer;
pub use limiter::{BodyLimit, CapturedBody, OmissionReason, DEFAULT_BODY_LIMIT};
pub use masking::{MaskingPolicy, DEFAULT_HIDDEN_KEYS, MASK};
pub use middleware::{
    handler_fn, BoxFuture, BoxedNext, HandlerError, HandlerResult, MiddlewareLayer, Request,
    Response, StreamingResponse,
};
pub use payload::{ErrorEntry, PayloadBuilder, TelemetryPayload};
pub use reporter::{HttpTransport, PayloadSource, Reporter, ReporterMetrics, Transport};
pub use transform::{BodyTransformer, TransformError, Transformer};

/// SDK version reported in every payload.
pub const TREBLLE_SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
