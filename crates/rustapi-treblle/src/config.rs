//! Configuration for the Treblle middleware.
//!
//! [`TreblleConfig`] collects explicit options; [`TreblleConfig::resolve`]
//! merges them with `TREBLLE_*` environment variables exactly once and
//! produces the immutable [`Settings`] every component reads.
//!
//! ```ignore
//! use rustapi_treblle::{config, TreblleConfig};
//!
//! config::load_dotenv();
//!
//! let settings = TreblleConfig::new()
//!     .hidden_key("iban")
//!     .skip_path("/health")
//!     .limit_request_body_size(1024 * 1024)
//!     .resolve()?;
//! ```

use crate::error::{ConfigError, Result};
use crate::limiter::{BodyLimit, DEFAULT_BODY_LIMIT};
use crate::masking::MaskingPolicy;
use crate::transform::{BodyTransformer, Transformer};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Collector hosts used when none are configured.
pub const DEFAULT_ENDPOINTS: &[&str] = &[
    "https://rocknrolla.treblle.com",
    "https://punisher.treblle.com",
    "https://sicario.treblle.com",
];

/// Per-attempt delivery timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Attempts per payload, capped at the number of endpoints.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Payloads that may wait for delivery before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Deliveries in flight at once.
pub const DEFAULT_MAX_CONCURRENT_DELIVERIES: usize = 16;

const ENV_PREFIX: &str = "TREBLLE_";

/// Load a `.env` file from the current directory or its parents.
///
/// Returns the path that was loaded, or `None` if no file was found.
pub fn load_dotenv() -> Option<PathBuf> {
    dotenvy::dotenv().ok()
}

/// Load a specific `.env` file.
pub fn load_dotenv_from(path: impl AsRef<Path>) -> Result<()> {
    dotenvy::from_path(path.as_ref())?;
    Ok(())
}

/// `TREBLLE_*` variables, all optional.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    api_key: Option<String>,
    project_id: Option<String>,
    hidden_keys: Option<Vec<String>>,
    mask_auth_header: Option<bool>,
    limit_request_body_size: Option<usize>,
    endpoints: Option<Vec<String>>,
}

impl EnvOverrides {
    fn from_env() -> Result<Self> {
        Ok(envy::prefixed(ENV_PREFIX).from_env()?)
    }

    fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed(ENV_PREFIX).from_iter(vars)?)
    }
}

/// Builder for the middleware configuration.
///
/// Explicit values win over environment variables, which win over defaults.
/// Hidden keys are merged from every source.
#[derive(Clone, Default)]
pub struct TreblleConfig {
    api_key: Option<String>,
    project_id: Option<String>,
    hidden_keys: Vec<String>,
    mask_auth_header: Option<bool>,
    limit_request_body_size: Option<usize>,
    endpoints: Option<Vec<String>>,
    request_transformer: Transformer,
    response_transformer: Transformer,
    timeout: Option<Duration>,
    max_attempts: Option<usize>,
    queue_capacity: Option<usize>,
    max_concurrent_deliveries: Option<usize>,
    skip_paths: HashSet<String>,
    skip_path_prefixes: HashSet<String>,
    server_software: Option<String>,
}

impl TreblleConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the collector API key.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the project id.
    pub fn project_id(mut self, id: impl Into<String>) -> Self {
        self.project_id = Some(id.into());
        self
    }

    /// Add a case-insensitive hidden-key pattern.
    pub fn hidden_key(mut self, key: impl Into<String>) -> Self {
        self.hidden_keys.push(key.into());
        self
    }

    /// Add several hidden-key patterns.
    pub fn hidden_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.hidden_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Enable or disable scheme-preserving Authorization masking.
    pub fn mask_auth_header(mut self, enabled: bool) -> Self {
        self.mask_auth_header = Some(enabled);
        self
    }

    /// Set the body capture ceiling in bytes.
    ///
    /// Applies to request and response bodies independently.
    pub fn limit_request_body_size(mut self, bytes: usize) -> Self {
        self.limit_request_body_size = Some(bytes);
        self
    }

    /// Replace the collector endpoint list.
    pub fn endpoints(mut self, endpoints: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.endpoints = Some(endpoints.into_iter().map(Into::into).collect());
        self
    }

    /// Override request body conversion.
    pub fn request_transformer<T: BodyTransformer>(mut self, transformer: T) -> Self {
        self.request_transformer = Transformer::user(transformer);
        self
    }

    /// Override response body conversion.
    pub fn response_transformer<T: BodyTransformer>(mut self, transformer: T) -> Self {
        self.response_transformer = Transformer::user(transformer);
        self
    }

    /// Set the per-attempt delivery timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many endpoints a payload may be tried against.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the delivery queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Set how many deliveries may run at once.
    pub fn max_concurrent_deliveries(mut self, n: usize) -> Self {
        self.max_concurrent_deliveries = Some(n);
        self
    }

    /// Skip capture for an exact path.
    pub fn skip_path(mut self, path: impl Into<String>) -> Self {
        self.skip_paths.insert(path.into());
        self
    }

    /// Skip capture for every path under a prefix.
    pub fn skip_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.skip_path_prefixes.insert(prefix.into());
        self
    }

    /// Server software reported in the payload, e.g. `"rustapi/0.1"`.
    pub fn server_software(mut self, software: impl Into<String>) -> Self {
        self.server_software = Some(software.into());
        self
    }

    /// Resolve against the process environment.
    pub fn resolve(self) -> Result<Settings> {
        let env = EnvOverrides::from_env()?;
        self.merge(env)
    }

    /// Resolve against an explicit list of variables instead of the process
    /// environment.
    pub fn resolve_from_vars<I>(self, vars: I) -> Result<Settings>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let env = EnvOverrides::from_vars(vars)?;
        self.merge(env)
    }

    fn merge(self, env: EnvOverrides) -> Result<Settings> {
        let api_key = non_blank(self.api_key)
            .or_else(|| non_blank(env.api_key))
            .ok_or(ConfigError::MissingApiKey)?;
        let project_id = non_blank(self.project_id)
            .or_else(|| non_blank(env.project_id))
            .ok_or(ConfigError::MissingProjectId)?;

        let mask_auth_header = self.mask_auth_header.or(env.mask_auth_header).unwrap_or(true);
        let additions = env.hidden_keys.unwrap_or_default().into_iter().chain(self.hidden_keys);
        let masking = MaskingPolicy::new(additions, mask_auth_header);

        let limit = self
            .limit_request_body_size
            .or(env.limit_request_body_size)
            .unwrap_or(DEFAULT_BODY_LIMIT);
        if limit == 0 {
            return Err(ConfigError::InvalidLimit("limit_request_body_size"));
        }

        let endpoints = self
            .endpoints
            .or(env.endpoints)
            .unwrap_or_else(|| DEFAULT_ENDPOINTS.iter().map(|e| e.to_string()).collect());
        let endpoints = validate_endpoints(endpoints)?;

        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        if timeout.is_zero() {
            return Err(ConfigError::InvalidLimit("timeout"));
        }
        let max_attempts = positive(self.max_attempts, DEFAULT_MAX_ATTEMPTS, "max_attempts")?;
        let queue_capacity = positive(self.queue_capacity, DEFAULT_QUEUE_CAPACITY, "queue_capacity")?;
        let max_concurrent_deliveries = positive(
            self.max_concurrent_deliveries,
            DEFAULT_MAX_CONCURRENT_DELIVERIES,
            "max_concurrent_deliveries",
        )?;

        Ok(Settings {
            api_key,
            project_id,
            masking,
            body_limit: BodyLimit::new(limit),
            request_transformer: self.request_transformer,
            response_transformer: self.response_transformer,
            delivery: DeliverySettings {
                endpoints,
                timeout,
                max_attempts,
                queue_capacity,
                max_concurrent_deliveries,
            },
            skip_paths: self.skip_paths,
            skip_path_prefixes: self.skip_path_prefixes,
            server_software: self.server_software.unwrap_or_else(|| "rustapi".to_string()),
        })
    }
}

impl std::fmt::Debug for TreblleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreblleConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<set>"))
            .field("project_id", &self.project_id)
            .field("hidden_keys", &self.hidden_keys)
            .field("mask_auth_header", &self.mask_auth_header)
            .field("limit_request_body_size", &self.limit_request_body_size)
            .field("endpoints", &self.endpoints)
            .field("request_transformer", &self.request_transformer)
            .field("response_transformer", &self.response_transformer)
            .field("skip_paths", &self.skip_paths)
            .finish()
    }
}

/// Reporter settings.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Collector endpoints, tried in rotation.
    pub endpoints: Vec<String>,
    /// Timeout for one attempt.
    pub timeout: Duration,
    /// Distinct endpoints a payload may be tried against.
    pub max_attempts: usize,
    /// Bounded queue size.
    pub queue_capacity: usize,
    /// Concurrent deliveries.
    pub max_concurrent_deliveries: usize,
}

/// Resolved, immutable configuration.
#[derive(Clone)]
pub struct Settings {
    pub(crate) api_key: String,
    pub(crate) project_id: String,
    pub(crate) masking: MaskingPolicy,
    pub(crate) body_limit: BodyLimit,
    pub(crate) request_transformer: Transformer,
    pub(crate) response_transformer: Transformer,
    pub(crate) delivery: DeliverySettings,
    pub(crate) skip_paths: HashSet<String>,
    pub(crate) skip_path_prefixes: HashSet<String>,
    pub(crate) server_software: String,
}

impl Settings {
    /// The collector API key.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// The project id.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// The masking policy.
    pub fn masking(&self) -> &MaskingPolicy {
        &self.masking
    }

    /// The body capture ceiling.
    pub fn body_limit(&self) -> BodyLimit {
        self.body_limit
    }

    /// Delivery settings.
    pub fn delivery(&self) -> &DeliverySettings {
        &self.delivery
    }

    /// Check if a path is excluded from capture.
    pub fn should_skip_path(&self, path: &str) -> bool {
        self.skip_paths.contains(path)
            || self
                .skip_path_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("project_id", &self.project_id)
            .field("masking", &self.masking)
            .field("body_limit", &self.body_limit)
            .field("request_transformer", &self.request_transformer)
            .field("response_transformer", &self.response_transformer)
            .field("delivery", &self.delivery)
            .field("skip_paths", &self.skip_paths)
            .field("skip_path_prefixes", &self.skip_path_prefixes)
            .field("server_software", &self.server_software)
            .finish_non_exhaustive()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn positive(value: Option<usize>, default: usize, name: &'static str) -> Result<usize> {
    match value.unwrap_or(default) {
        0 => Err(ConfigError::InvalidLimit(name)),
        n => Ok(n),
    }
}

fn validate_endpoints(endpoints: Vec<String>) -> Result<Vec<String>> {
    let endpoints: Vec<String> = endpoints
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    if endpoints.is_empty() {
        return Err(ConfigError::NoEndpoints);
    }

    for endpoint in &endpoints {
        let url = reqwest::Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
            url: endpoint.clone(),
            reason: e.to_string(),
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidEndpoint {
                url: endpoint.clone(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }
    }
    Ok(endpoints)
}
