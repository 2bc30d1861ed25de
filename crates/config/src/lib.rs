//! Configuration loading, validation, and management for Loopwire.
//!
//! Loads configuration from `~/.loopwire/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.loopwire/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Upstream API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model used for every upstream call
    #[serde(default = "default_model")]
    pub model: String,

    /// Default max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// System prompt sent with every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Upstream provider connection settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("system_prompt", &self.system_prompt)
            .field("provider", &self.provider)
            .field("agent", &self.agent)
            .field("gateway", &self.gateway)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// HTTP timeout for a single upstream call
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn default_provider_timeout() -> u64 {
    300
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

/// What to do with tool input that is not valid JSON when its block closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedInputPolicy {
    /// Run the tool with `{}` as its input.
    #[default]
    EmptyObject,
    /// Skip the tool and ask the model to re-issue the call.
    ReportToModel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upstream attempts per iteration, including the first
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// First backoff delay; doubled on each further attempt
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Character budget for a serialized tool result
    #[serde(default = "default_tool_result_budget")]
    pub tool_result_budget: usize,

    #[serde(default)]
    pub malformed_input: MalformedInputPolicy,
}

fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    2000
}
fn default_tool_result_budget() -> usize {
    6000
}

impl AgentConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            tool_result_budget: default_tool_result_budget(),
            malformed_input: MalformedInputPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Seconds between keep-alive comment frames on an open stream
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Hard ceiling for one streamed request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_heartbeat_interval() -> u64 {
    20
}
fn default_request_timeout() -> u64 {
    300
}

impl GatewayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path with env var overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("LOOPWIRE_API_KEY")
                .ok()
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok());
        }

        if let Ok(model) = std::env::var("LOOPWIRE_MODEL") {
            self.model = model;
        }

        if let Ok(base_url) = std::env::var("LOOPWIRE_BASE_URL") {
            self.provider.base_url = base_url;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".loopwire")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.temperature < 0.0 || self.temperature > 1.0 {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 1.0".into(),
            ));
        }

        if self.agent.retry_max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "agent.retry_max_attempts must be at least 1".into(),
            ));
        }

        if self.agent.tool_result_budget == 0 {
            return Err(ConfigError::ValidationError(
                "agent.tool_result_budget must be > 0".into(),
            ));
        }

        if self.gateway.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "gateway.heartbeat_interval_secs must be > 0".into(),
            ));
        }

        if self.gateway.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "gateway.request_timeout_secs must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            system_prompt: None,
            provider: ProviderConfig::default(),
            agent: AgentConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
