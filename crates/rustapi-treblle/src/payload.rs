//! Wire-format telemetry payload.
//!
//! The shape follows the collector schema:
//!
//! ```text
//! { api_key, project_id, sdk_info: {...},
//!   data: { server, language, request, response, errors } }
//! ```
//!
//! A payload is assembled once by [`PayloadBuilder`] and never modified
//! afterwards.

use crate::capture::{CaptureContext, ResponseSnapshot};
use crate::config::Settings;
use crate::error::CaptureError;
use crate::limiter::OmissionReason;
use crate::masking::MaskingPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::OnceLock;

/// SDK name reported to the collector.
pub const SDK_NAME: &str = "rustapi";

/// Error entry `source` used by the collector for runtime errors.
const ERROR_SOURCE: &str = "onError";

/// The complete payload sent to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Collector credential.
    pub api_key: String,
    /// Project identifier.
    pub project_id: String,
    /// SDK identification.
    pub sdk_info: SdkInfo,
    /// The captured exchange.
    pub data: PayloadData,
}

impl TelemetryPayload {
    /// Check if any error was recorded.
    pub fn has_errors(&self) -> bool {
        !self.data.errors.is_empty()
    }
}

/// SDK identification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdkInfo {
    /// SDK name.
    pub name: String,
    /// SDK version.
    pub version: String,
}

impl Default for SdkInfo {
    fn default() -> Self {
        Self {
            name: SDK_NAME.to_string(),
            version: crate::TREBLLE_SDK_VERSION.to_string(),
        }
    }
}

/// The `data` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadData {
    /// Host information.
    pub server: ServerInfo,
    /// Runtime language information.
    pub language: LanguageInfo,
    /// Masked request.
    pub request: RequestInfo,
    /// Masked response, or an omission marker when none was produced.
    pub response: ResponseSection,
    /// Errors recorded during the exchange.
    pub errors: Vec<ErrorEntry>,
}

/// Host information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Host IP address.
    pub ip: String,
    /// Local timezone name.
    pub timezone: String,
    /// Server software name.
    pub software: String,
    /// Server software version, when `software` carried one.
    pub signature: String,
    /// HTTP protocol of this exchange.
    pub protocol: String,
    /// Operating system.
    pub os: OsInfo,
}

/// Operating system details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsInfo {
    /// OS name.
    pub name: String,
    /// Kernel/OS release.
    pub release: String,
    /// CPU architecture.
    pub architecture: String,
}

impl ServerInfo {
    /// Host details, gathered on first use and reused afterwards.
    ///
    /// `software` is split on a single `/` into name and signature, so
    /// `"rustapi/0.1"` becomes `("rustapi", "0.1")`.
    pub fn detect(software: &str) -> Self {
        let host = HostInfo::get();
        let (software, signature) = match software.split_once('/') {
            Some((name, version)) if !version.contains('/') => (name.to_string(), version.to_string()),
            _ => (software.to_string(), String::new()),
        };

        Self {
            ip: host.ip.clone(),
            timezone: host.timezone.clone(),
            software,
            signature,
            protocol: String::new(),
            os: host.os.clone(),
        }
    }
}

/// Process-wide host facts.
struct HostInfo {
    ip: String,
    timezone: String,
    os: OsInfo,
}

impl HostInfo {
    fn get() -> &'static HostInfo {
        static HOST: OnceLock<HostInfo> = OnceLock::new();
        HOST.get_or_init(|| HostInfo {
            ip: host_ip().unwrap_or_else(|| "unknown".to_string()),
            timezone: chrono::Local::now().format("%Z").to_string(),
            os: OsInfo {
                name: sysinfo::System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
                release: sysinfo::System::kernel_version().unwrap_or_default(),
                architecture: std::env::consts::ARCH.to_string(),
            },
        })
    }
}

/// First IPv4 address the hostname resolves to.
fn host_ip() -> Option<String> {
    let hostname = sysinfo::System::host_name()?;
    let addrs = (hostname.as_str(), 0).to_socket_addrs().ok()?;
    addrs
        .map(|addr| addr.ip())
        .find(IpAddr::is_ipv4)
        .map(|ip| ip.to_string())
}

/// Runtime language information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageInfo {
    /// Always `"rust"`.
    pub name: String,
    /// Minimum supported compiler version of this SDK.
    pub version: String,
}

impl Default for LanguageInfo {
    fn default() -> Self {
        Self {
            name: "rust".to_string(),
            version: option_env!("CARGO_PKG_RUST_VERSION")
                .filter(|v| !v.is_empty())
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

/// The masked request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    /// `YYYY-MM-DD HH:MM:SS` in UTC.
    pub timestamp: String,
    /// Client address.
    pub ip: String,
    /// Full request URL.
    pub url: String,
    /// `User-Agent` header, or empty.
    pub user_agent: String,
    /// HTTP method.
    pub method: String,
    /// Masked headers.
    pub headers: BTreeMap<String, String>,
    /// Masked body or an omission marker.
    pub body: Value,
}

/// The masked response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    /// Masked headers.
    pub headers: BTreeMap<String, String>,
    /// Status code.
    pub code: u16,
    /// Body size in bytes.
    pub size: usize,
    /// Milliseconds between request start and response capture.
    pub load_time: f64,
    /// Masked body or an omission marker.
    pub body: Value,
}

/// Either a captured response or an explicit marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseSection {
    /// A response was produced.
    Captured(ResponseInfo),
    /// No response exists, e.g. the handler failed.
    Omitted(Value),
}

impl ResponseSection {
    /// The captured response, if there is one.
    pub fn captured(&self) -> Option<&ResponseInfo> {
        match self {
            ResponseSection::Captured(info) => Some(info),
            ResponseSection::Omitted(_) => None,
        }
    }
}

/// One recorded error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Where the error was observed.
    pub source: String,
    /// Error type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Error message.
    pub message: String,
}

impl ErrorEntry {
    /// Create an entry.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: ERROR_SOURCE.to_string(),
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&CaptureError> for ErrorEntry {
    fn from(err: &CaptureError) -> Self {
        ErrorEntry::new(err.kind(), err.to_string())
    }
}

/// Assembles payloads from per-request snapshots.
///
/// Holds only process-wide, read-only data. Headers are masked here; bodies
/// arrive already masked.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    api_key: String,
    project_id: String,
    sdk_info: SdkInfo,
    software: String,
    server: OnceLock<ServerInfo>,
    language: LanguageInfo,
    masking: MaskingPolicy,
}

impl PayloadBuilder {
    /// Create a builder from resolved settings.
    ///
    /// Host detection resolves the hostname, so it is left to the first
    /// [`PayloadBuilder::build`], which runs on the reporter's blocking pool.
    pub fn new(settings: &Settings) -> Self {
        Self {
            api_key: settings.api_key().to_string(),
            project_id: settings.project_id().to_string(),
            sdk_info: SdkInfo::default(),
            software: settings.server_software.clone(),
            server: OnceLock::new(),
            language: LanguageInfo::default(),
            masking: settings.masking().clone(),
        }
    }

    /// Create a builder with explicit host information.
    pub fn with_server(
        api_key: impl Into<String>,
        project_id: impl Into<String>,
        server: ServerInfo,
        masking: MaskingPolicy,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            project_id: project_id.into(),
            sdk_info: SdkInfo::default(),
            software: server.software.clone(),
            server: OnceLock::from(server),
            language: LanguageInfo::default(),
            masking,
        }
    }

    fn server(&self) -> &ServerInfo {
        self.server.get_or_init(|| ServerInfo::detect(&self.software))
    }

    /// Build the payload for one exchange.
    ///
    /// `request_body` and the response body must already be masked. Without
    /// a response snapshot the response section is an omission marker and an
    /// error entry is added unless `errors` already explains the failure.
    pub fn build(
        &self,
        ctx: &CaptureContext,
        response: Option<(&ResponseSnapshot, Value)>,
        request_body: Value,
        mut errors: Vec<ErrorEntry>,
    ) -> TelemetryPayload {
        let mut server = self.server().clone();
        server.protocol = ctx.protocol.clone();

        let request = RequestInfo {
            timestamp: ctx.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            ip: ctx.client_ip.clone(),
            url: ctx.url.clone(),
            user_agent: ctx.user_agent.clone(),
            method: ctx.method.clone(),
            headers: self.masking.mask_headers(&ctx.headers),
            body: request_body,
        };

        let response = match response {
            Some((snapshot, body)) => ResponseSection::Captured(ResponseInfo {
                headers: self.masking.mask_headers(&snapshot.headers),
                code: snapshot.status,
                size: snapshot.size,
                load_time: elapsed_ms(ctx, snapshot),
                body,
            }),
            None => {
                if errors.is_empty() {
                    errors.push(ErrorEntry::new(
                        "MissingResponse",
                        "no response was captured for this request",
                    ));
                }
                ResponseSection::Omitted(OmissionReason::NotAvailable.marker())
            }
        };

        TelemetryPayload {
            api_key: self.api_key.clone(),
            project_id: self.project_id.clone(),
            sdk_info: self.sdk_info.clone(),
            data: PayloadData {
                server,
                language: self.language.clone(),
                request,
                response,
                errors,
            },
        }
    }
}

/// Elapsed milliseconds, clamped at zero.
fn elapsed_ms(ctx: &CaptureContext, snapshot: &ResponseSnapshot) -> f64 {
    snapshot
        .finished_at
        .saturating_duration_since(ctx.started_at)
        .as_secs_f64()
        * 1000.0
}
