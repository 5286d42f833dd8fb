//! TOML Configuration File Support
//!
//! Configuration for the agent conductor lives in
//! `~/.config/agent-conductor/conductor.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [agent]
//! program = "python3"
//! args = ["daemon.py"]
//! working_dir = "/home/me/agent"
//! provider = "google"
//! model = "gemini-2.5-flash"
//! shared_config_path = "/home/me/agent/config.json"
//! shutdown_grace_ms = 3000
//!
//! [protocol]
//! completion_marker = "__DONE__"
//! readiness_sentinel = "Browser started"
//! error_tag = "[error]"
//! system_tag = "[daemon]"
//! error_keywords = ["error", "exception", "traceback"]
//! extra_noise = ["[playwright]"]
//!
//! [server]
//! bind_address = "127.0.0.1:8765"
//! max_connections = 16
//! channel_capacity = 256
//! max_message_size = 65536
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::EventKind;
use crate::protocol::{
    FramingConfig, NoiseFilter, StderrClassifier, TagRule, DEFAULT_COMPLETION_MARKER,
    DEFAULT_ERROR_KEYWORDS, DEFAULT_ERROR_TAG, DEFAULT_MAX_LINE_LENGTH, DEFAULT_READINESS_SENTINEL,
    DEFAULT_SYSTEM_TAG,
};

/// Provider used when none is given
pub const DEFAULT_PROVIDER: &str = "browser-use";

/// Model used when none is given
pub const DEFAULT_MODEL: &str = "default";

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "AGENT_CONDUCTOR_CONFIG";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// Command-line arguments
    Cli,
    /// Environment variables
    Env,
    /// TOML file
    File,
    /// Built-in defaults
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Cli => write!(f, "CLI"),
            ConfigSource::Env => write!(f, "environment"),
            ConfigSource::File => write!(f, "config file"),
            ConfigSource::Default => write!(f, "defaults"),
        }
    }
}

// =============================================================================
// TOML Structures
// =============================================================================

/// `[agent]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentToml {
    /// Executable to launch
    pub program: Option<String>,
    /// Arguments placed before provider and model
    pub args: Option<Vec<String>>,
    /// Working directory of the child
    pub working_dir: Option<PathBuf>,
    /// Default provider identifier
    pub provider: Option<String>,
    /// Default model identifier
    pub model: Option<String>,
    /// File the provider/model JSON is written to before launch
    pub shared_config_path: Option<PathBuf>,
    /// How long `stop()` waits before killing the child
    pub shutdown_grace_ms: Option<u64>,
}

/// `[protocol]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolToml {
    /// Token ending one task's output
    pub completion_marker: Option<String>,
    /// Substring announcing the agent is initialised
    pub readiness_sentinel: Option<String>,
    /// Line prefix for error messages
    pub error_tag: Option<String>,
    /// Line prefix for system messages
    pub system_tag: Option<String>,
    /// Keywords that make a stderr line an error
    pub error_keywords: Option<Vec<String>>,
    /// Additional substrings treated as stderr noise
    pub extra_noise: Option<Vec<String>>,
    /// Longest unterminated stdout line held back, in bytes (0: no limit)
    pub max_line_length: Option<usize>,
}

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// WebSocket listen address
    pub bind_address: Option<String>,
    /// Maximum concurrent WebSocket clients
    pub max_connections: Option<usize>,
    /// Per-subscriber outbound queue capacity
    pub channel_capacity: Option<usize>,
    /// Maximum inbound frame size in bytes
    pub max_message_size: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorToml {
    /// Agent process section
    pub agent: AgentToml,
    /// Text protocol section
    pub protocol: ProtocolToml,
    /// WebSocket server section
    pub server: ServerToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Provider and model handed to the agent on launch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Provider identifier, lower-case
    pub provider: String,
    /// Model identifier
    pub model: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl AgentSettings {
    /// Normalise and build settings
    ///
    /// The provider is trimmed and lower-cased, the model trimmed. Blank
    /// values fall back to [`DEFAULT_PROVIDER`] and [`DEFAULT_MODEL`].
    pub fn new(provider: impl AsRef<str>, model: impl AsRef<str>) -> Self {
        let provider = provider.as_ref().trim().to_lowercase();
        let model = model.as_ref().trim();
        Self {
            provider: if provider.is_empty() {
                DEFAULT_PROVIDER.to_string()
            } else {
                provider
            },
            model: if model.is_empty() {
                DEFAULT_MODEL.to_string()
            } else {
                model.to_string()
            },
        }
    }

    /// Replace whichever fields are given, keeping the rest
    #[must_use]
    pub fn with_overrides(&self, provider: Option<&str>, model: Option<&str>) -> Self {
        Self::new(
            provider.unwrap_or(&self.provider),
            model.unwrap_or(&self.model),
        )
    }

    /// JSON document written to the shared config file
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for AgentSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// How to launch the agent
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig {
    /// Executable to launch
    pub program: String,
    /// Arguments placed before provider and model
    pub args: Vec<String>,
    /// Working directory of the child (inherited when `None`)
    pub working_dir: Option<PathBuf>,
    /// Default provider and model
    pub settings: AgentSettings,
    /// Where to write the provider/model JSON before launch
    pub shared_config_path: Option<PathBuf>,
    /// How long `stop()` waits before killing the child
    pub shutdown_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["daemon.py".to_string()],
            working_dir: None,
            settings: AgentSettings::default(),
            shared_config_path: None,
            shutdown_grace: Duration::from_millis(3000),
        }
    }
}

/// Literals of the agent's text protocol
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Token ending one task's output
    pub completion_marker: String,
    /// Substring announcing the agent is initialised
    pub readiness_sentinel: String,
    /// Line prefix for error messages
    pub error_tag: String,
    /// Line prefix for system messages
    pub system_tag: String,
    /// Keywords that make a stderr line an error
    pub error_keywords: Vec<String>,
    /// Additional substrings treated as stderr noise
    pub extra_noise: Vec<String>,
    /// Longest unterminated stdout line held back, in bytes (0: no limit)
    pub max_line_length: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            completion_marker: DEFAULT_COMPLETION_MARKER.to_string(),
            readiness_sentinel: DEFAULT_READINESS_SENTINEL.to_string(),
            error_tag: DEFAULT_ERROR_TAG.to_string(),
            system_tag: DEFAULT_SYSTEM_TAG.to_string(),
            error_keywords: DEFAULT_ERROR_KEYWORDS
                .iter()
                .map(|k| (*k).to_string())
                .collect(),
            extra_noise: Vec::new(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl ProtocolConfig {
    /// Decoder settings for stdout
    #[must_use]
    pub fn framing(&self) -> FramingConfig {
        let mut tags = Vec::with_capacity(2);
        if !self.error_tag.is_empty() {
            tags.push(TagRule::new(self.error_tag.clone(), EventKind::Error));
        }
        if !self.system_tag.is_empty() {
            tags.push(TagRule::new(self.system_tag.clone(), EventKind::System));
        }
        FramingConfig {
            completion_marker: self.completion_marker.clone(),
            readiness_sentinel: self.readiness_sentinel.clone(),
            tags,
            max_line_length: self.max_line_length,
        }
    }

    /// Classifier for stderr
    #[must_use]
    pub fn stderr_classifier(&self) -> StderrClassifier {
        StderrClassifier::new(
            NoiseFilter::with_extra(self.extra_noise.iter()),
            self.error_keywords.iter(),
        )
    }
}

/// WebSocket surface settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address
    pub bind_address: String,
    /// Maximum concurrent clients
    pub max_connections: usize,
    /// Per-subscriber outbound queue capacity
    pub channel_capacity: usize,
    /// Maximum inbound frame size in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8765".to_string(),
            max_connections: 16,
            channel_capacity: 256,
            max_message_size: 65536,
        }
    }
}

/// Centralized configuration for the conductor
///
/// Consolidates all sources and tracks where the values came from. Use
/// [`load_config`] to load with proper priority handling.
#[derive(Clone, Debug, Default)]
pub struct ConductorConfig {
    /// Agent process
    pub agent: AgentConfig,
    /// Text protocol literals
    pub protocol: ProtocolConfig,
    /// WebSocket surface
    pub server: ServerConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl ConductorConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check the values the runtime depends on
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.agent.program.trim().is_empty() {
            return invalid("agent.program must not be empty");
        }
        if self.protocol.completion_marker.is_empty() {
            return invalid("protocol.completion_marker must not be empty");
        }
        if self.protocol.completion_marker.contains(['\n', '\r']) {
            return invalid("protocol.completion_marker must not contain a line break");
        }
        if self.protocol.readiness_sentinel.is_empty() {
            return invalid("protocol.readiness_sentinel must not be empty");
        }
        if self.server.max_connections == 0 {
            return invalid("server.max_connections must be greater than zero");
        }
        if self.server.channel_capacity == 0 {
            return invalid("server.channel_capacity must be greater than zero");
        }
        if self.server.max_message_size == 0 {
            return invalid("server.max_message_size must be greater than zero");
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/agent-conductor/conductor.toml` or
/// `~/.config/agent-conductor/conductor.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("agent-conductor").join("conductor.toml"))
}

/// Load configuration from all sources with proper priority
///
/// The file is `$AGENT_CONDUCTOR_CONFIG` when set, otherwise
/// [`default_config_path`]. CLI overrides are the caller's job.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed,
/// or if the merged result fails validation. A missing file is not an error.
pub fn load_config() -> Result<ConductorConfig, ConfigError> {
    let path = std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .or_else(default_config_path);
    load_config_from_path(path)
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the merged result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ConductorConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<ConductorConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ConductorConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ConductorToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;

    Ok(config)
}

fn apply_toml_config(config: &mut ConductorConfig, toml: &ConductorToml) {
    let agent = &toml.agent;
    if let Some(ref program) = agent.program {
        config.agent.program = program.clone();
    }
    if let Some(ref args) = agent.args {
        config.agent.args = args.clone();
    }
    if agent.working_dir.is_some() {
        config.agent.working_dir = agent.working_dir.clone();
    }
    if agent.provider.is_some() || agent.model.is_some() {
        config.agent.settings = config
            .agent
            .settings
            .with_overrides(agent.provider.as_deref(), agent.model.as_deref());
    }
    if agent.shared_config_path.is_some() {
        config.agent.shared_config_path = agent.shared_config_path.clone();
    }
    if let Some(ms) = agent.shutdown_grace_ms {
        config.agent.shutdown_grace = Duration::from_millis(ms);
    }

    let protocol = &toml.protocol;
    if let Some(ref marker) = protocol.completion_marker {
        config.protocol.completion_marker = marker.clone();
    }
    if let Some(ref sentinel) = protocol.readiness_sentinel {
        config.protocol.readiness_sentinel = sentinel.clone();
    }
    if let Some(ref tag) = protocol.error_tag {
        config.protocol.error_tag = tag.clone();
    }
    if let Some(ref tag) = protocol.system_tag {
        config.protocol.system_tag = tag.clone();
    }
    if let Some(ref keywords) = protocol.error_keywords {
        config.protocol.error_keywords = keywords.clone();
    }
    if let Some(ref noise) = protocol.extra_noise {
        config.protocol.extra_noise = noise.clone();
    }
    if let Some(max) = protocol.max_line_length {
        config.protocol.max_line_length = max;
    }

    let server = &toml.server;
    if let Some(ref bind) = server.bind_address {
        config.server.bind_address = bind.clone();
    }
    if let Some(n) = server.max_connections {
        config.server.max_connections = n;
    }
    if let Some(n) = server.channel_capacity {
        config.server.channel_capacity = n;
    }
    if let Some(n) = server.max_message_size {
        config.server.max_message_size = n;
    }
}

fn apply_env_config<F>(config: &mut ConductorConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(program) = env("AGENT_PROGRAM") {
        config.agent.program = program;
        config.source = ConfigSource::Env;
    }
    if let Some(dir) = env("AGENT_WORKDIR") {
        config.agent.working_dir = Some(PathBuf::from(dir));
        config.source = ConfigSource::Env;
    }

    let provider = env("AGENT_PROVIDER");
    let model = env("AGENT_MODEL");
    if provider.is_some() || model.is_some() {
        config.agent.settings = config
            .agent
            .settings
            .with_overrides(provider.as_deref(), model.as_deref());
        config.source = ConfigSource::Env;
    }

    if let Some(bind) = env("AGENT_CONDUCTOR_BIND") {
        config.server.bind_address = bind;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Agent executable override
    pub program: Option<String>,
    /// Working directory override
    pub working_dir: Option<PathBuf>,
    /// Provider override
    pub provider: Option<String>,
    /// Model override
    pub model: Option<String>,
    /// Bind address override
    pub bind_address: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set agent executable override
    #[must_use]
    pub fn with_program(mut self, program: String) -> Self {
        self.program = Some(program);
        self
    }

    /// Set working directory override
    #[must_use]
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Set provider override
    #[must_use]
    pub fn with_provider(mut self, provider: String) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Set bind address override
    #[must_use]
    pub fn with_bind_address(mut self, bind: String) -> Self {
        self.bind_address = Some(bind);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.program.is_none()
            && self.working_dir.is_none()
            && self.provider.is_none()
            && self.model.is_none()
            && self.bind_address.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ConductorConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref program) = self.program {
            config.agent.program = program.clone();
        }
        if let Some(ref dir) = self.working_dir {
            config.agent.working_dir = Some(dir.clone());
        }
        if self.provider.is_some() || self.model.is_some() {
            config.agent.settings = config
                .agent
                .settings
                .with_overrides(self.provider.as_deref(), self.model.as_deref());
        }
        if let Some(ref bind) = self.bind_address {
            config.server.bind_address = bind.clone();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
