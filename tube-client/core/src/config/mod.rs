//! TOML Configuration File Support
//!
//! Configuration loading for the stream tube client, from a TOML file at
//! `~/.config/tube-client/client.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. Caller overrides ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/tube-client/client.toml` (typically `~/.config/tube-client/client.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [client]
//! name = "VncViewer"
//! p2p_services = ["x-vnc"]
//! room_services = []
//! monitor_connections = true
//! bypass_approval = false
//!
//! [accept]
//! mode = "unix"
//! require_credentials = true
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::TubeClientOptions;

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

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from a caller override
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Acceptance mode selected in configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptModeConfig {
    /// Accept tubes as TCP sockets (Localhost AC)
    Tcp,
    /// Accept tubes as Unix sockets
    Unix,
}

impl std::str::FromStr for AcceptModeConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            other => Err(ConfigError::ValidationError(format!(
                "unknown accept mode '{other}' (expected 'tcp' or 'unix')"
            ))),
        }
    }
}

/// Client section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    /// Client name to register under
    pub name: Option<String>,

    /// Services accepted from single contacts
    pub p2p_services: Option<Vec<String>>,

    /// Services accepted in rooms
    pub room_services: Option<Vec<String>>,

    /// Whether to emit connection events
    pub monitor_connections: Option<bool>,

    /// Whether to skip user approval
    pub bypass_approval: Option<bool>,
}

/// Accept section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptToml {
    /// Acceptance mode
    pub mode: Option<AcceptModeConfig>,

    /// Whether Unix acceptance asks for Credentials AC
    pub require_credentials: Option<bool>,
}

/// Root TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TubeClientToml {
    /// Client settings
    pub client: ClientToml,

    /// Accept settings
    pub accept: AcceptToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Fully resolved client configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TubeClientConfig {
    /// Client name (generated when `None`)
    pub client_name: Option<String>,
    /// Services accepted from single contacts
    pub p2p_services: Vec<String>,
    /// Services accepted in rooms
    pub room_services: Vec<String>,
    /// Whether to emit connection events
    pub monitor_connections: bool,
    /// Whether to skip user approval
    pub bypass_approval: bool,
    /// Acceptance mode to apply after creation (`None` leaves it to the caller)
    pub accept_mode: Option<AcceptModeConfig>,
    /// Whether Unix acceptance asks for Credentials AC
    pub require_credentials: bool,
    /// File the configuration was read from
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for TubeClientConfig {
    fn default() -> Self {
        Self {
            client_name: None,
            p2p_services: Vec::new(),
            room_services: Vec::new(),
            monitor_connections: false,
            bypass_approval: false,
            accept_mode: None,
            require_credentials: false,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl TubeClientConfig {
    /// Create a new config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the configuration source
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check the configuration can build a client
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if no service is configured or
    /// a service name is blank.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.p2p_services.is_empty() && self.room_services.is_empty() {
            return Err(ConfigError::ValidationError(
                "empty service list".to_string(),
            ));
        }
        if let Some(blank) = self
            .p2p_services
            .iter()
            .chain(&self.room_services)
            .find(|s| s.trim().is_empty())
        {
            return Err(ConfigError::ValidationError(format!(
                "blank service name {blank:?}"
            )));
        }
        Ok(())
    }

    /// Client construction options for this configuration
    #[must_use]
    pub fn options(&self) -> TubeClientOptions {
        TubeClientOptions {
            p2p_services: self.p2p_services.clone(),
            room_services: self.room_services.clone(),
            client_name: self.client_name.clone(),
            monitor_connections: self.monitor_connections,
            bypass_approval: self.bypass_approval,
        }
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/tube-client/client.toml` or
/// `~/.config/tube-client/client.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tube-client").join("client.toml"))
}

/// Load configuration from the default path
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed.
pub fn load_config() -> Result<TubeClientConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// A missing file is not an error: defaults and environment variables are
/// used instead.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<TubeClientConfig, ConfigError> {
    let mut config = TubeClientConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: TubeClientToml = toml::from_str(&toml_content)?;
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

    apply_env_config(&mut config);

    Ok(config)
}

fn apply_toml_config(config: &mut TubeClientConfig, toml: &TubeClientToml) {
    if let Some(ref name) = toml.client.name {
        config.client_name = Some(name.clone());
    }
    if let Some(ref services) = toml.client.p2p_services {
        config.p2p_services = services.clone();
    }
    if let Some(ref services) = toml.client.room_services {
        config.room_services = services.clone();
    }
    if let Some(monitor) = toml.client.monitor_connections {
        config.monitor_connections = monitor;
    }
    if let Some(bypass) = toml.client.bypass_approval {
        config.bypass_approval = bypass;
    }

    if let Some(mode) = toml.accept.mode {
        config.accept_mode = Some(mode);
    }
    if let Some(require) = toml.accept.require_credentials {
        config.require_credentials = require;
    }
}

fn parse_flag(value: &str) -> bool {
    value != "0" && value.to_lowercase() != "false"
}

fn apply_env_config(config: &mut TubeClientConfig) {
    if let Ok(name) = std::env::var("TUBE_CLIENT_NAME") {
        config.client_name = Some(name);
        config.source = ConfigSource::Env;
    }
    if let Ok(monitor) = std::env::var("TUBE_CLIENT_MONITOR_CONNECTIONS") {
        config.monitor_connections = parse_flag(&monitor);
        config.source = ConfigSource::Env;
    }
    if let Ok(bypass) = std::env::var("TUBE_CLIENT_BYPASS_APPROVAL") {
        config.bypass_approval = parse_flag(&bypass);
        config.source = ConfigSource::Env;
    }
    if let Ok(mode) = std::env::var("TUBE_CLIENT_ACCEPT_MODE") {
        match mode.parse::<AcceptModeConfig>() {
            Ok(mode) => {
                config.accept_mode = Some(mode);
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring TUBE_CLIENT_ACCEPT_MODE"),
        }
    }
    if let Ok(require) = std::env::var("TUBE_CLIENT_REQUIRE_CREDENTIALS") {
        config.require_credentials = parse_flag(&require);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// Caller Overrides
// =============================================================================

/// Overrides applied on top of file and environment configuration
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Client name override
    pub client_name: Option<String>,
    /// Acceptance mode override
    pub accept_mode: Option<AcceptModeConfig>,
    /// Credentials override
    pub require_credentials: Option<bool>,
    /// Connection monitoring override
    pub monitor_connections: Option<bool>,
}

impl ConfigOverrides {
    /// Create empty overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the client name
    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Override the acceptance mode
    #[must_use]
    pub fn with_accept_mode(mut self, mode: AcceptModeConfig) -> Self {
        self.accept_mode = Some(mode);
        self
    }

    /// Override the credentials requirement
    #[must_use]
    pub fn with_require_credentials(mut self, require: bool) -> Self {
        self.require_credentials = Some(require);
        self
    }

    /// Override connection monitoring
    #[must_use]
    pub fn with_monitor_connections(mut self, monitor: bool) -> Self {
        self.monitor_connections = Some(monitor);
        self
    }

    /// Apply the overrides; the source becomes `Cli` if anything changed
    pub fn apply(&self, config: &mut TubeClientConfig) {
        let mut changed = false;

        if let Some(ref name) = self.client_name {
            config.client_name = Some(name.clone());
            changed = true;
        }
        if let Some(mode) = self.accept_mode {
            config.accept_mode = Some(mode);
            changed = true;
        }
        if let Some(require) = self.require_credentials {
            config.require_credentials = require;
            changed = true;
        }
        if let Some(monitor) = self.monitor_connections {
            config.monitor_connections = monitor;
            changed = true;
        }

        if changed {
            config.source = ConfigSource::Cli;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
