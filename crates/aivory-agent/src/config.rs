use aivory_core::release::{self, ReleaseOptions, ReleaseRecord};
use aivory_core::wire::{RuntimeIdentity, DEFAULT_COLLECTOR_URL};
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

pub const DEFAULT_ENVIRONMENT: &str = "production";
pub const DEFAULT_SAMPLING_RATE: f64 = 1.0;
pub const DEFAULT_MAX_CAPTURE_DEPTH: usize = 10;
pub const DEFAULT_MAX_STRING_LENGTH: usize = 1000;
pub const DEFAULT_MAX_COLLECTION_SIZE: usize = 100;
pub const DEFAULT_SCOPE_DEPTH: u8 = 0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing api key: pass `api_key` to init or set AIVORY_API_KEY")]
    MissingApiKey,
    #[error("invalid collector url '{url}': {source}")]
    InvalidCollectorUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("invalid inspector url '{url}': {source}")]
    InvalidInspectorUrl {
        url: String,
        source: url::ParseError,
    },
}

pub type HookFn = std::sync::Arc<dyn Fn(&crate::pipeline::HostError) + Send + Sync>;

/// Explicit initialization options. Every field overrides the matching
/// `AIVORY_*` environment variable.
#[derive(Default)]
pub struct AgentOptions {
    pub api_key: Option<String>,
    pub collector_url: Option<String>,
    /// WebSocket endpoint of the host inspector. When absent (and
    /// `AIVORY_INSPECTOR_URL` is unset) the agent runs without a debugger
    /// session and only the hook/manual capture paths are active.
    pub inspector_url: Option<String>,
    pub environment: Option<String>,
    pub sampling_rate: Option<f64>,
    pub max_capture_depth: Option<usize>,
    pub max_string_length: Option<usize>,
    pub max_collection_size: Option<usize>,
    pub scope_depth: Option<u8>,
    pub enable_breakpoints: Option<bool>,
    pub enable_sourcemaps: Option<bool>,
    pub debug: Option<bool>,
    pub runtime: Option<String>,
    pub runtime_version: Option<String>,
    /// Custom context merged into every capture.
    pub context: BTreeMap<String, Value>,
    pub release: ReleaseOptions,
    /// Pre-existing host handlers chained after capture.
    pub on_uncaught_exception: Option<HookFn>,
    pub on_unhandled_rejection: Option<HookFn>,
}

/// Immutable agent configuration, shared read-only after `init`.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub collector_url: Url,
    pub inspector_url: Option<Url>,
    pub environment: String,
    pub sampling_rate: f64,
    pub max_capture_depth: usize,
    pub max_string_length: usize,
    pub max_collection_size: usize,
    pub scope_depth: u8,
    pub enable_breakpoints: bool,
    pub enable_sourcemaps: bool,
    pub debug: bool,
    pub agent_id: String,
    pub hostname: String,
    pub runtime: String,
    pub runtime_version: String,
    pub release: Option<ReleaseRecord>,
    pub base_context: BTreeMap<String, Value>,
}

impl Config {
    pub fn resolve(options: &AgentOptions) -> Result<Self, ConfigError> {
        Self::resolve_with(options, &|name| std::env::var(name).ok())
    }

    pub(crate) fn resolve_with(
        options: &AgentOptions,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let api_key = options
            .api_key
            .clone()
            .or_else(|| non_empty(env("AIVORY_API_KEY")))
            .ok_or(ConfigError::MissingApiKey)?;

        let collector_url = options
            .collector_url
            .clone()
            .or_else(|| non_empty(env("AIVORY_BACKEND_URL")))
            .unwrap_or_else(|| DEFAULT_COLLECTOR_URL.to_string());
        let collector_url =
            Url::parse(&collector_url).map_err(|source| ConfigError::InvalidCollectorUrl {
                url: collector_url.clone(),
                source,
            })?;

        let inspector_url = options
            .inspector_url
            .clone()
            .or_else(|| non_empty(env("AIVORY_INSPECTOR_URL")));
        let inspector_url = match inspector_url {
            Some(raw) => Some(Url::parse(&raw).map_err(|source| {
                ConfigError::InvalidInspectorUrl { url: raw, source }
            })?),
            None => None,
        };

        let sampling_rate = options
            .sampling_rate
            .or_else(|| parse_env(env("AIVORY_SAMPLING_RATE")))
            .unwrap_or(DEFAULT_SAMPLING_RATE)
            .clamp(0.0, 1.0);

        Ok(Self {
            api_key,
            collector_url,
            inspector_url,
            environment: options
                .environment
                .clone()
                .or_else(|| non_empty(env("AIVORY_ENVIRONMENT")))
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            sampling_rate,
            max_capture_depth: options
                .max_capture_depth
                .or_else(|| parse_env(env("AIVORY_MAX_DEPTH")))
                .unwrap_or(DEFAULT_MAX_CAPTURE_DEPTH),
            max_string_length: options
                .max_string_length
                .or_else(|| parse_env(env("AIVORY_MAX_STRING_LENGTH")))
                .unwrap_or(DEFAULT_MAX_STRING_LENGTH),
            max_collection_size: options
                .max_collection_size
                .or_else(|| parse_env(env("AIVORY_MAX_COLLECTION_SIZE")))
                .unwrap_or(DEFAULT_MAX_COLLECTION_SIZE),
            scope_depth: options
                .scope_depth
                .or_else(|| parse_env(env("AIVORY_SCOPE_DEPTH")))
                .unwrap_or(DEFAULT_SCOPE_DEPTH),
            enable_breakpoints: options
                .enable_breakpoints
                .or_else(|| parse_bool(env("AIVORY_ENABLE_BREAKPOINTS")))
                .unwrap_or(true),
            enable_sourcemaps: options
                .enable_sourcemaps
                .or_else(|| parse_bool(env("AIVORY_ENABLE_SOURCEMAPS")))
                .unwrap_or(true),
            debug: options
                .debug
                .or_else(|| parse_bool(env("AIVORY_DEBUG")))
                .unwrap_or(false),
            agent_id: generate_agent_id(),
            hostname: resolve_hostname(),
            runtime: options
                .runtime
                .clone()
                .unwrap_or_else(|| "node".to_string()),
            runtime_version: options
                .runtime_version
                .clone()
                .or_else(|| non_empty(env("AIVORY_RUNTIME_VERSION")))
                .unwrap_or_else(|| "unknown".to_string()),
            release: release::resolve_with(&options.release, env),
            base_context: options.context.clone(),
        })
    }

    /// Uniform sampling decision, one draw per exception.
    pub fn sample(&self) -> bool {
        if self.sampling_rate >= 1.0 {
            return true;
        }
        if self.sampling_rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < self.sampling_rate
    }

    pub fn identity(&self) -> RuntimeIdentity {
        RuntimeIdentity {
            agent_id: self.agent_id.clone(),
            environment: self.environment.clone(),
            runtime: self.runtime.clone(),
            runtime_version: self.runtime_version.clone(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

fn generate_agent_id() -> String {
    let suffix: [u8; 4] = rand::thread_rng().gen();
    format!(
        "agent-{:016}-{:02x}{:02x}{:02x}{:02x}",
        Utc::now().timestamp_millis(),
        suffix[0],
        suffix[1],
        suffix[2],
        suffix[3],
    )
}

fn resolve_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|raw| raw.trim().parse().ok())
}

fn parse_bool(value: Option<String>) -> Option<bool> {
    match value?.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" | "off" | "OFF" => Some(false),
        _ => None,
    }
}
