//! Configuration loading from toolhost.toml.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use registry::{CommandHandler, ParameterSchema, Registry, ToolDescriptor};
use serde::Deserialize;

/// Default HTTP bind address.
pub const DEFAULT_BIND: &str = "127.0.0.1:8000";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,

    /// Tools in registration order.
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// A tool backed by an external command.
#[derive(Debug, Deserialize)]
pub struct ToolConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Program to run per call. Receives the arguments as JSON on stdin.
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Set to false for back-ends that cannot run concurrently.
    #[serde(default = "default_reentrant")]
    pub reentrant: bool,

    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub parameters: ParameterSchema,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_reentrant() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Build a registry with one command handler per configured tool.
    pub fn registry(&self) -> Result<Registry, ConfigError> {
        let mut registry = Registry::new();
        for tool in &self.tools {
            if tool.command.trim().is_empty() {
                return Err(ConfigError::MissingCommand(tool.name.clone()));
            }

            let mut handler = CommandHandler::new(&tool.command)
                .args(&tool.args)
                .env(tool.env.clone())
                .reentrant(tool.reentrant);
            if let Some(secs) = tool.timeout_secs {
                handler = handler.timeout(Duration::from_secs(secs));
            }

            let descriptor = ToolDescriptor::new(&tool.name, &tool.description)
                .with_schema(tool.parameters.clone());
            registry.register(descriptor, handler)?;
        }
        Ok(registry)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("tool `{0}` has no command")]
    MissingCommand(String),

    #[error(transparent)]
    Registry(#[from] registry::Error),
}
