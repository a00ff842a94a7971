//! TOML-based configuration for a mirror node.
//!
//! Reads and writes `AppConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\MirrorNode\config.toml`
//! - Linux:    `~/.config/mirrornode/config.toml`
//! - macOS:    `~/Library/Application Support/MirrorNode/config.toml`
//!
//! An explicit path (`--config` / `MIRROR_CONFIG`) overrides the platform
//! location.
//!
//! # Example
//!
//! ```toml
//! [identity]
//! hostname = "mirror-lobby"
//!
//! [network]
//! device_address = "192.168.1.8:8000"
//!
//! [discovery]
//! interval_secs = 5
//!
//! [export]
//! secret = "change-me"
//! ```
//!
//! # Serde default values
//!
//! Every section and every field has a default, so a missing file, a missing
//! section, or a missing key all produce a working configuration.  This
//! matters on first run and when upgrading from an older file.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mirror_core::protocol::DEFAULT_ANNOUNCE_PORT;
use mirror_core::MirrorId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

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

    /// A field parsed as TOML but holds an unusable value.
    #[error("invalid value {value:?} for {field}")]
    Invalid { field: &'static str, value: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Who this mirror is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
    /// Globally unique hostname; the peer registry key.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Stable mirror id.  Empty means "same as hostname".
    #[serde(default)]
    pub mirror_id: String,
}

impl IdentityConfig {
    pub fn mirror_id(&self) -> MirrorId {
        if self.mirror_id.trim().is_empty() {
            MirrorId::new(self.hostname.clone())
        } else {
            MirrorId::new(self.mirror_id.trim())
        }
    }
}

/// How phones and peers reach this mirror's HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Externally reachable root URL, e.g. `https://mirror.example`.
    /// Empty when the mirror is only reachable through `device_address`.
    #[serde(default)]
    pub public_base_url: String,
    /// `host:port` of this device on the LAN.
    #[serde(default = "default_device_address")]
    pub device_address: String,
    /// Backend port used when neither address above carries one.
    #[serde(default = "default_app_port")]
    pub app_port: u16,
}

impl NetworkConfig {
    /// Root URL for QR and export links: `public_base_url`, else
    /// `http://<device_address>`.  Never ends with `/`.
    pub fn public_root(&self) -> String {
        let public = self.public_base_url.trim().trim_end_matches('/');
        if public.is_empty() {
            format!("http://{}", self.device_address.trim().trim_end_matches('/'))
        } else {
            public.to_string()
        }
    }
}

/// LAN discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// UDP port for announces and probes.
    #[serde(default = "default_announce_port")]
    pub announce_port: u16,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Where announces are sent.  A directed broadcast (`192.168.1.255`) or a
    /// unicast address also works.
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
    /// Explicit IP to advertise; empty means auto-detect.
    #[serde(default)]
    pub advertised_ip: String,
    /// Explicit host for the advertised base URL.
    #[serde(default)]
    pub hostname: String,
    /// Advertise `http://<hostname><suffix>:<port>` instead of the IP.
    #[serde(default)]
    pub use_hostname: bool,
    /// Appended to a dotless hostname when `use_hostname` is on, e.g. `".local"`.
    #[serde(default)]
    pub hostname_suffix: String,
    /// Include the transfer public key in announces so peers can verify
    /// this mirror's tokens without manual key distribution.
    #[serde(default)]
    pub publish_public_key: bool,
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `broadcast_address` is not an IP literal.
    pub fn broadcast_ip(&self) -> Result<IpAddr, ConfigError> {
        self.broadcast_address
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid {
                field: "discovery.broadcast_address",
                value: self.broadcast_address.clone(),
            })
    }
}

/// Transfer token keys and lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferConfig {
    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,
    #[serde(default = "default_public_key_path")]
    pub public_key_path: PathBuf,
    /// JWT algorithm name, e.g. `"RS256"`, `"ES256"`, `"EdDSA"`.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_transfer_ttl_secs")]
    pub ttl_secs: u64,
    /// Verify incoming tokens with the key the issuing peer published via
    /// discovery (first key seen per mirror id) instead of
    /// `public_key_path`.  Ignored for HMAC algorithms.
    #[serde(default)]
    pub trust_published_keys: bool,
}

/// Export token secret and policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportConfig {
    /// HS256 secret.  Export is disabled while this is empty.
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_export_ttl_secs")]
    pub ttl_secs: u64,
    /// Reject a second redemption of the same session's export.
    #[serde(default)]
    pub single_use: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_hostname() -> String {
    "local-mirror".to_string()
}
fn default_device_address() -> String {
    "192.168.1.8:8000".to_string()
}
fn default_app_port() -> u16 {
    8000
}
fn default_true() -> bool {
    true
}
fn default_announce_port() -> u16 {
    DEFAULT_ANNOUNCE_PORT
}
fn default_interval_secs() -> u64 {
    10
}
fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}
fn default_private_key_path() -> PathBuf {
    PathBuf::from("keys/private.pem")
}
fn default_public_key_path() -> PathBuf {
    PathBuf::from("keys/public.pem")
}
fn default_algorithm() -> String {
    "RS256".to_string()
}
fn default_transfer_ttl_secs() -> u64 {
    120
}
fn default_export_ttl_secs() -> u64 {
    600
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            mirror_id: String::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            public_base_url: String::new(),
            device_address: default_device_address(),
            app_port: default_app_port(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            announce_port: default_announce_port(),
            interval_secs: default_interval_secs(),
            broadcast_address: default_broadcast_address(),
            advertised_ip: String::new(),
            hostname: String::new(),
            use_hostname: false,
            hostname_suffix: String::new(),
            publish_public_key: false,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            private_key_path: default_private_key_path(),
            public_key_path: default_public_key_path(),
            algorithm: default_algorithm(),
            ttl_secs: default_transfer_ttl_secs(),
            trust_published_keys: false,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            ttl_secs: default_export_ttl_secs(),
            single_use: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the platform config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads from the platform config file, or defaults if it does not exist.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
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

/// Resolves the platform config directory including the `MirrorNode` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("MirrorNode"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("mirrornode"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("MirrorNode")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
