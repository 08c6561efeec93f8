//! Configuration (layered: defaults < TOML file < environment).
//!
//! Loaded once by the embedding process and handed to the components; the
//! core never re-reads the environment at runtime.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TetherError};
use crate::util::duration_ms;
use crate::util::retry::RetryPolicy;

const DEFAULT_BASE_URL: &str = "http://localhost:3000/api";

/// Top-level configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub storage_dir: PathBuf,
    pub session: SessionSettings,
    pub router: RouterConfig,
    pub conversation: ConversationConfig,
    pub stream: StreamConfig,
}

impl fmt::Debug for TetherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TetherConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("storage_dir", &self.storage_dir)
            .field("session", &self.session)
            .field("router", &self.router)
            .field("conversation", &self.conversation)
            .field("stream", &self.stream)
            .finish()
    }
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            storage_dir: default_storage_dir(),
            session: SessionSettings::default(),
            router: RouterConfig::default(),
            conversation: ConversationConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

/// Session registry settings.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Idle time after which a session without listeners is evicted.
    #[builder(default = Duration::from_secs(30 * 60))]
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    #[builder(default = Duration::from_secs(60))]
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// TTL for cached workspace/agent existence checks.
    #[builder(default = Duration::from_secs(5 * 60))]
    #[serde(with = "duration_ms")]
    pub validation_cache_ttl: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Message router settings.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// In-flight operations allowed per session.
    #[builder(default = 3)]
    pub max_concurrent: usize,
    /// Admissions allowed per window per session.
    #[builder(default = 60)]
    pub rate_limit_max: u32,
    #[builder(default = Duration::from_secs(60))]
    #[serde(with = "duration_ms")]
    pub rate_limit_window: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Per-conversation limits and timers.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    #[builder(default = 100)]
    pub max_history: usize,
    #[builder(default = 100_000)]
    pub max_tokens: usize,
    #[builder(default = Duration::from_secs(5 * 60))]
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    #[builder(default = Duration::from_secs(60 * 60))]
    #[serde(with = "duration_ms")]
    pub max_duration: Duration,
    /// Token-budget ratio at which summarization kicks in.
    #[builder(default = 0.75)]
    pub summarize_threshold: f64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Upstream streaming settings.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Per-attempt timeout for connecting and for each body read.
    #[builder(default = Duration::from_secs(30))]
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    #[builder(default)]
    pub retry: RetryPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TetherConfig {
    /// Load from environment variables, reading `.env` if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // missing .env is fine
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Parse a TOML document; absent fields keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| TetherError::Configuration(format!("invalid config file: {e}")))
    }

    /// Read a TOML config file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TetherError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let _ = dotenvy::dotenv();
        Self::from_toml_str(&raw)?.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `TETHER_*` overrides from an arbitrary variable lookup.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(key) = lookup("TETHER_API_KEY").filter(|k| !k.is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(url) = lookup("TETHER_BASE_URL").filter(|u| !u.is_empty()) {
            self.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(dir) = lookup("TETHER_STORAGE_DIR").filter(|d| !d.is_empty()) {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TETHER_SESSION_TTL_SECS")? {
            self.session.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TETHER_SWEEP_INTERVAL_SECS")? {
            self.session.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(max) = parse_var::<usize>(&lookup, "TETHER_MAX_CONCURRENT")? {
            self.router.max_concurrent = max;
        }
        if let Some(max) = parse_var::<u32>(&lookup, "TETHER_RATE_LIMIT_MAX")? {
            self.router.rate_limit_max = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TETHER_RATE_LIMIT_WINDOW_MS")? {
            self.router.rate_limit_window = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TETHER_REQUEST_TIMEOUT_MS")? {
            self.stream.request_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_var::<u32>(&lookup, "TETHER_MAX_RETRIES")? {
            self.stream.retry.max_retries = retries;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values the core cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(TetherError::Configuration("base_url must not be empty".into()));
        }
        if self.router.max_concurrent == 0 {
            return Err(TetherError::Configuration(
                "router.max_concurrent must be at least 1".into(),
            ));
        }
        if self.router.rate_limit_window.is_zero() {
            return Err(TetherError::Configuration(
                "router.rate_limit_window must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.conversation.summarize_threshold) {
            return Err(TetherError::Configuration(
                "conversation.summarize_threshold must be within 0..=1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| TetherError::Configuration(format!("{name} has invalid value {raw:?}"))),
    }
}

fn default_storage_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".tether").join("sessions"))
        .unwrap_or_else(|| PathBuf::from(".tether/sessions"))
}
