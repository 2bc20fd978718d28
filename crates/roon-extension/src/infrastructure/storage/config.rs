//! TOML configuration for the extension.
//!
//! Read from an explicit path or the platform-appropriate config file:
//! - Windows:  `%APPDATA%\RoonExtension\config.toml`
//! - Linux:    `~/.config/roon-extension/config.toml`
//! - macOS:    `~/Library/Application Support/RoonExtension/config.toml`
//!
//! ```toml
//! [extension]
//! extension_id = "com.example.volume-sync"
//! display_name = "Volume Sync"
//! display_version = "1.0.0"
//! publisher = "Example"
//! email = "dev@example.com"
//! log_level = "normal"
//!
//! [discovery]
//! enabled = true
//! query_interval_secs = 10
//! ```
//!
//! Every field has a serde default, so a missing file or a partial file both
//! load cleanly.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ExtensionInfo, MetadataError};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// A value is out of range.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

// ── Frame logging ─────────────────────────────────────────────────────────────

/// Which MOO frames get logged.
///
/// Peers tag chatty requests with `Logging: quiet`; `normal` skips those,
/// `all` logs them anyway, `none` logs no frames at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameLogLevel {
    All,
    #[default]
    Normal,
    #[serde(rename = "none")]
    Off,
}

impl FrameLogLevel {
    /// Whether a frame with the given quiet flag should be logged.
    pub fn allows(self, quiet: bool) -> bool {
        match self {
            Self::All => true,
            Self::Normal => !quiet,
            Self::Off => false,
        }
    }
}

impl FromStr for FrameLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "normal" => Ok(Self::Normal),
            "none" => Ok(Self::Off),
            other => Err(format!("unknown frame log level {other:?} (all, normal, none)")),
        }
    }
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExtensionConfig {
    #[serde(default)]
    pub extension: ExtensionSection,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Identity the extension registers with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtensionSection {
    #[serde(default = "default_extension_id")]
    pub extension_id: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_display_version")]
    pub display_version: String,
    #[serde(default = "default_publisher")]
    pub publisher: String,
    #[serde(default = "default_email")]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default)]
    pub required_services: Vec<String>,
    #[serde(default)]
    pub optional_services: Vec<String>,
    #[serde(default)]
    pub log_level: FrameLogLevel,
}

/// Built-in pairing service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// SOOD discovery timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How often local interfaces are re-enumerated.
    #[serde(default = "default_rescan_secs")]
    pub rescan_interval_secs: u64,
    /// Query tick; see the discovery schedule for which ticks actually send.
    #[serde(default = "default_query_secs")]
    pub query_interval_secs: u64,
}

/// WebSocket transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
}

/// Where pairing state is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    /// Defaults to `state.toml` next to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_extension_id() -> String {
    "org.example.roon-extension".to_string()
}
fn default_display_name() -> String {
    "Rust Roon Extension".to_string()
}
fn default_display_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_publisher() -> String {
    "Roon Extension Contributors".to_string()
}
fn default_email() -> String {
    "extensions@example.org".to_string()
}
fn default_true() -> bool {
    true
}
fn default_rescan_secs() -> u64 {
    5
}
fn default_query_secs() -> u64 {
    10
}
fn default_heartbeat_secs() -> u64 {
    10
}

impl Default for ExtensionSection {
    fn default() -> Self {
        Self {
            extension_id: default_extension_id(),
            display_name: default_display_name(),
            display_version: default_display_version(),
            publisher: default_publisher(),
            email: default_email(),
            website: None,
            required_services: Vec::new(),
            optional_services: Vec::new(),
            log_level: FrameLogLevel::default(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            rescan_interval_secs: default_rescan_secs(),
            query_interval_secs: default_query_secs(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_secs(),
        }
    }
}

impl ExtensionSection {
    /// The metadata sent in the registration request.
    pub fn info(&self) -> ExtensionInfo {
        ExtensionInfo {
            extension_id: self.extension_id.clone(),
            display_name: self.display_name.clone(),
            display_version: self.display_version.clone(),
            publisher: self.publisher.clone(),
            email: self.email.clone(),
            website: self.website.clone(),
            required_services: self.required_services.clone(),
            optional_services: self.optional_services.clone(),
        }
    }
}

impl DiscoveryConfig {
    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    pub fn query_interval(&self) -> Duration {
        Duration::from_secs(self.query_interval_secs)
    }
}

impl TransportConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl ExtensionConfig {
    /// Checks metadata and timer values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Metadata`] for empty identity fields and
    /// [`ConfigError::Invalid`] for zero intervals.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.extension.info().validate()?;
        if self.discovery.rescan_interval_secs == 0 || self.discovery.query_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "discovery intervals must be at least 1 second".to_string(),
            ));
        }
        if self.transport.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat interval must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves the persisted-state path: the configured one, or
    /// `state.toml` in the platform config directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoPlatformConfigDir`] if no path is configured
    /// and the platform directory is unknown.
    pub fn state_file(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.state_file {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("state.toml")),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from `path` (or the default location), returning
/// `ExtensionConfig::default()` if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<ExtensionConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ExtensionConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Writes `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &ExtensionConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config directory for this application.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("RoonExtension"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("roon-extension"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("RoonExtension")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
