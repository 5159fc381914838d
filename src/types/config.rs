//! Configuration types for nowpilot.
//!
//! Configuration is read from a TOML file. Every field has a default, so an
//! empty file (or no file at all) yields a working local setup that spawns
//! the ServiceNow MCP server from `PATH`.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8787"
//!
//! [mcp]
//! command = "/usr/local/bin/servicenow-mcp"
//! tool_prefix = "servicenow"
//!
//! [pool]
//! size = 4
//! acquire_timeout = "5s"
//!
//! [retry]
//! max_retries = 3
//! base_delay = "1s"
//!
//! [approval]
//! required = ["*delete*", "*update*"]
//! ```
//!
//! Durations are human-readable strings (`"250ms"`, `"5s"`, `"2m"`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The platform config directory could not be determined.
    #[error("could not determine config directory")]
    NoConfigDir,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub mcp: McpSettings,
    pub pool: PoolSettings,
    pub retry: RetrySettings,
    pub approval: ApprovalSettings,
    pub rate_limit: RateLimitSettings,
    pub model: ModelSettings,
    pub session: SessionSettings,
}

/// WebSocket gateway settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the gateway listens on.
    pub bind: String,
    /// Interval between WebSocket pings.
    #[serde(with = "duration_str")]
    pub heartbeat: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            heartbeat: Duration::from_secs(30),
        }
    }
}

/// How to reach the tool-execution server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    /// Executable that speaks MCP over stdio.
    pub command: String,
    /// Arguments for the executable.
    pub args: Vec<String>,
    /// Extra environment (instance URL, credentials).
    pub env: HashMap<String, String>,
    /// Namespace applied to tool names shown to the model and the client.
    pub tool_prefix: String,
    /// Per-request timeout on the wire.
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            command: "servicenow-mcp".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            tool_prefix: "servicenow".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of persistent connections.
    pub size: usize,
    /// How long `acquire` waits before reporting exhaustion.
    #[serde(with = "duration_str")]
    pub acquire_timeout: Duration,
    /// How often idle connections are pinged. `"0s"` disables the monitor.
    #[serde(with = "duration_str")]
    pub health_check_interval: Duration,
    /// How long shutdown waits for in-use connections.
    #[serde(with = "duration_str")]
    pub shutdown_grace: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 4,
            acquire_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Retry queue settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries allowed per call after the first attempt.
    pub max_retries: u32,
    /// Delay unit; the n-th retry waits `base_delay * n`.
    #[serde(with = "duration_str")]
    pub base_delay: Duration,
    /// Also retry failures reported by the remote tool itself.
    pub retry_tool_errors: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            retry_tool_errors: false,
        }
    }
}

/// Approval gate settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    /// Glob patterns over display tool names that need approval.
    pub required: Vec<String>,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            required: vec![
                "*delete*".to_string(),
                "*update*".to_string(),
                "*close*".to_string(),
            ],
        }
    }
}

/// Sliding-window admission limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Window length.
    #[serde(with = "duration_str")]
    pub window: Duration,
    /// Messages admitted per client per window (0 = unlimited).
    pub max_messages: usize,
    /// Tool calls admitted per conversation per window (0 = unlimited).
    pub max_tool_calls: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_messages: 20,
            max_tool_calls: 60,
        }
    }
}

/// Language model settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Default model when `message.submit` carries none.
    pub name: String,
    /// API base URL.
    pub api_base: String,
    /// Maximum tokens per response.
    pub max_tokens: u32,
    /// Maximum tool calls planned for one message.
    pub max_tools_per_message: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            name: "claude-sonnet-4-20250514".to_string(),
            api_base: "https://api.anthropic.com".to_string(),
            max_tokens: 4096,
            max_tools_per_message: 4,
        }
    }
}

/// Streaming session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Previous messages loaded as context.
    pub context_messages: usize,
    /// How long a cancelled session waits for an in-flight tool call.
    #[serde(with = "duration_str")]
    pub cancel_grace: Duration,
    /// How long a conversation with nothing running keeps its approval
    /// state. Zero forgets it as soon as its last message finishes.
    #[serde(with = "duration_str")]
    pub conversation_idle_ttl: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            context_messages: 10,
            cancel_grace: Duration::from_secs(2),
            conversation_idle_ttl: Duration::from_secs(30 * 60),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid or a value is out of range.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file at `path` if given, else the default location if it
    /// exists, else the built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Ok(default) if default.exists() => Self::from_file(&default),
            _ => Ok(Self::default()),
        }
    }

    /// Returns the default config path (`<config dir>/nowpilot/config.toml`).
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = directories::ProjectDirs::from("com", "nowpilot", "nowpilot")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.size == 0 {
            return Err(ConfigError::Invalid("pool.size must be at least 1".into()));
        }
        if self.pool.acquire_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "pool.acquire_timeout must be positive".into(),
            ));
        }
        if self.mcp.command.trim().is_empty() {
            return Err(ConfigError::Invalid("mcp.command must not be empty".into()));
        }
        if self.rate_limit.window.is_zero()
            && (self.rate_limit.max_messages > 0 || self.rate_limit.max_tool_calls > 0)
        {
            return Err(ConfigError::Invalid(
                "rate_limit.window must be positive when limits are set".into(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter for humantime duration strings.
mod duration_str {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
