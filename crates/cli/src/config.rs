//! Configuration loading from toolcall.toml.

use std::collections::HashMap;
use std::path::Path;

use runtime::DecisionMode;
use runtime::providers::DEFAULT_MODEL;
use serde::Deserialize;

/// Environment variable consulted when no API key is configured.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

/// Decision provider configuration.
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    /// Gemini API key. Falls back to `GEMINI_API_KEY`.
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default)]
    pub mode: DecisionMode,

    /// Override the API root.
    pub base_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            mode: DecisionMode::default(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Stdio,
}

/// How to reach the tool host.
#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,

    /// Tool host URL (http).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Tool host program (stdio).
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Per-call bound.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            base_url: default_base_url(),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// The configured API key, or `GEMINI_API_KEY` from the environment.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        resolve_api_key(
            self.provider.api_key.as_deref(),
            std::env::var(API_KEY_ENV).ok().as_deref(),
        )
    }
}

fn resolve_api_key(configured: Option<&str>, env: Option<&str>) -> Result<String, ConfigError> {
    configured
        .or(env)
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(String::from)
        .ok_or(ConfigError::MissingApiKey)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("API key not configured: set provider.api_key or GEMINI_API_KEY")]
    MissingApiKey,

    #[error("stdio transport needs a command: set transport.command or --server-cmd")]
    MissingCommand,
}
