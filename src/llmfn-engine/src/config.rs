//! Engine configuration.
//!
//! Loaded from TOML:
//!
//! ```toml
//! [logging]
//! level = "debug"
//!
//! [providers.fast]
//! kind = "openai"
//! model = "llama-3.3-70b-versatile"
//! base_url = "https://api.groq.com/openai/v1"
//! api_key_env = "GROQ_API_KEY"
//! max_context_length = 131072
//! max_response_length = 8192
//!
//! [[providers.fast.rate_limits]]
//! type = "resetting"
//! name = "requests"
//! limit = 30
//! window_seconds = 60
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use llmfn_protocol::{ProviderDescriptor, ProviderKind};
use llmfn_ratelimits::{HeaderWindows, WindowLimit};
use serde::{Deserialize, Serialize};

use crate::error::{FunError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Providers by name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        for (name, provider) in &config.providers {
            provider
                .validate()
                .map_err(|e| FunError::config(format!("provider {name}: {e}")))?;
        }
        Ok(config)
    }

    /// Look up a provider by name.
    pub fn provider(&self, name: &str) -> Result<&ProviderConfig> {
        self.providers
            .get(name)
            .ok_or_else(|| FunError::config(format!("unknown provider: {name}")))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Configuration of one model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Wire format.
    pub kind: ProviderKind,
    /// Model identifier (used in API calls).
    pub model: String,
    /// Base URL for the API. Defaults to the vendor's public endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key. Prefer `api_key_env`.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Maximum number of tokens in prompt plus response.
    pub max_context_length: u64,
    /// Maximum number of tokens in a response.
    pub max_response_length: u64,
    /// Maximum number of request/response cycles in one call.
    #[serde(default = "default_max_exchanges")]
    pub max_exchanges: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Static fallback policies, used until the backend reports its own limits.
    #[serde(default)]
    pub rate_limits: Vec<StaticWindowConfig>,
    /// Window length assumed for the requests window learned from headers.
    #[serde(default = "default_window_seconds")]
    pub requests_window_seconds: u64,
    /// Window length assumed for the tokens window learned from headers.
    #[serde(default = "default_window_seconds")]
    pub tokens_window_seconds: u64,
    /// Key shared by providers using the same credential. Defaults to kind,
    /// base URL and model.
    #[serde(default)]
    pub rate_limit_key: Option<String>,
    /// Check on init that the model is listed as available.
    #[serde(default)]
    pub check_model: bool,
}

fn default_max_exchanges() -> u32 {
    10
}

fn default_timeout() -> u64 {
    120
}

fn default_window_seconds() -> u64 {
    60
}

impl ProviderConfig {
    /// A provider with defaults for everything but the essentials.
    pub fn new(
        kind: ProviderKind,
        model: impl Into<String>,
        max_context_length: u64,
        max_response_length: u64,
    ) -> Self {
        Self {
            kind,
            model: model.into(),
            base_url: None,
            api_key: None,
            api_key_env: None,
            max_context_length,
            max_response_length,
            max_exchanges: default_max_exchanges(),
            temperature: None,
            seed: None,
            timeout_seconds: default_timeout(),
            retry: RetryConfig::default(),
            rate_limits: Vec::new(),
            requests_window_seconds: default_window_seconds(),
            tokens_window_seconds: default_window_seconds(),
            rate_limit_key: None,
            check_model: false,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.model.is_empty() {
            return Err("model is required".to_string());
        }
        if self.max_response_length == 0 {
            return Err("max_response_length must be at least 1".to_string());
        }
        // Every request reserves room for two full responses.
        if self.max_response_length.saturating_mul(2) >= self.max_context_length {
            return Err(format!(
                "max_response_length {} must be less than half of max_context_length {}",
                self.max_response_length, self.max_context_length
            ));
        }
        if self.max_exchanges == 0 {
            return Err("max_exchanges must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        for window in &self.rate_limits {
            window.validate()?;
        }
        Ok(())
    }

    pub fn base_url(&self) -> String {
        let url = match (&self.base_url, self.kind) {
            (Some(url), _) => url.as_str(),
            (None, ProviderKind::OpenAi) => "https://api.openai.com/v1",
            (None, ProviderKind::Anthropic) => "https://api.anthropic.com",
        };
        url.trim_end_matches('/').to_string()
    }

    /// API key from the config, the configured environment variable, or the
    /// vendor's conventional environment variable, in that order.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        let var = self.api_key_env.as_deref().unwrap_or(match self.kind {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        });
        std::env::var(var).ok().filter(|k| !k.is_empty())
    }

    pub fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            kind: self.kind,
            model: self.model.clone(),
            base_url: self.base_url(),
            max_context_length: self.max_context_length,
            max_response_length: self.max_response_length,
            max_exchanges: self.max_exchanges,
            temperature: self.temperature,
            seed: self.seed,
        }
    }

    pub fn rate_limit_key(&self) -> String {
        self.rate_limit_key
            .clone()
            .unwrap_or_else(|| self.descriptor().rate_limit_key())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn header_windows(&self) -> HeaderWindows {
        HeaderWindows {
            requests: Duration::from_secs(self.requests_window_seconds),
            tokens: Duration::from_secs(self.tokens_window_seconds),
        }
    }

    /// Static policies as rate limiter windows.
    pub fn static_limits(&self) -> HashMap<String, WindowLimit> {
        self.rate_limits
            .iter()
            .map(|w| (w.name().to_string(), w.to_limit()))
            .collect()
    }
}

/// Retry settings for requests to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_min_wait_ms")]
    pub min_wait_ms: u64,
    /// Upper bound on any delay.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_min_wait_ms() -> u64 {
    1_000
}

fn default_max_wait_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_wait_ms: default_min_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(self.min_wait_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Static fallback rate-limit policy for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StaticWindowConfig {
    Resetting {
        name: String,
        limit: u64,
        window_seconds: u64,
    },
    TokenBucket {
        name: String,
        /// Units per second.
        rate: f64,
        burst: u64,
    },
}

impl StaticWindowConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Resetting { name, .. } | Self::TokenBucket { name, .. } => name,
        }
    }

    pub fn to_limit(&self) -> WindowLimit {
        match *self {
            Self::Resetting {
                limit,
                window_seconds,
                ..
            } => WindowLimit::resetting(limit, Duration::from_secs(window_seconds)),
            Self::TokenBucket { rate, burst, .. } => WindowLimit::token_bucket(rate, burst),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::Resetting {
                name,
                window_seconds,
                ..
            } if *window_seconds == 0 => {
                Err(format!("rate limit {name}: window_seconds must be positive"))
            }
            Self::TokenBucket { name, rate, .. } if !(*rate > 0.0 && rate.is_finite()) => {
                Err(format!("rate limit {name}: rate must be positive"))
            }
            _ => Ok(()),
        }
    }
}
