//! TOML-based configuration for the Bjorn manager.
//!
//! Reads and writes [`AppConfig`] at the platform-appropriate location:
//! - Windows:  `%APPDATA%\BjornManager\config.toml`
//! - Linux:    `$XDG_CONFIG_HOME/bjorn-manager/config.toml` (or `~/.config/...`)
//! - macOS:    `~/Library/Application Support/BjornManager/config.toml`
//!
//! ```toml
//! [manager]
//! log_level = "info"
//! show_device_gone = false
//!
//! [discovery]
//! strict_mode = true
//! subnets = ["172.20.1.0/24", "172.20.2.0/24"]
//!
//! [ssh]
//! user = "bjorn"
//! connect_timeout_secs = 15
//! ```
//!
//! Every field has a `#[serde(default = "...")]` so a missing file, a missing
//! section or a missing key all fall back to the built-in defaults.
//! Passwords are never stored here.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bjorn_core::{Ipv4Subnet, BLUETOOTH_SUBNET, USB_SUBNET};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::discover_devices::DiscoveryConfig;
use crate::application::remote_session::{default_ssh_dir, SessionConfig};

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

    /// A value parsed as TOML but is not usable.
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub ssh: SshSettings,
}

/// General behaviour of the manager front-end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagerConfig {
    /// Schema version string – bump when breaking changes are introduced.
    #[serde(default = "default_version")]
    pub version: String,
    /// `tracing` log level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Print `device_gone` events.
    #[serde(default)]
    pub show_device_gone: bool,
    /// Keep device aliases in `aliases.toml` across runs.
    #[serde(default)]
    pub persist_aliases: bool,
}

/// Discovery engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySettings {
    /// Only report hosts named like a Bjorn device.
    #[serde(default = "default_true")]
    pub strict_mode: bool,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_webapp_port")]
    pub webapp_port: u16,
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Subnets swept in addition to the default gateway's /24.
    #[serde(default = "default_subnets")]
    pub subnets: Vec<String>,
    /// Addresses never reported, on top of gateways and own interfaces.
    #[serde(default)]
    pub ignored_addresses: Vec<String>,
}

/// SSH connection defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshSettings {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Private key; when absent `~/.ssh/id_ed25519`, `id_rsa`, `id_ecdsa`
    /// are tried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Where installer files are uploaded.
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_version() -> String {
    "1.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_ssh_port() -> u16 {
    22
}
fn default_webapp_port() -> u16 {
    8000
}
fn default_stale_timeout_secs() -> u64 {
    90
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    5
}
fn default_subnets() -> Vec<String> {
    vec![BLUETOOTH_SUBNET.to_string(), USB_SUBNET.to_string()]
}
fn default_user() -> String {
    "bjorn".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_command_timeout_secs() -> u64 {
    30
}
fn default_remote_dir() -> String {
    "/home/bjorn".to_string()
}
fn default_service_name() -> String {
    "bjorn.service".to_string()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            log_level: default_log_level(),
            show_device_gone: false,
            persist_aliases: false,
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            strict_mode: default_true(),
            ssh_port: default_ssh_port(),
            webapp_port: default_webapp_port(),
            stale_timeout_secs: default_stale_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            subnets: default_subnets(),
            ignored_addresses: Vec::new(),
        }
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: default_user(),
            port: default_ssh_port(),
            key_path: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            remote_dir: default_remote_dir(),
            service_name: default_service_name(),
        }
    }
}

// ── Conversion into runtime settings ──────────────────────────────────────────

impl DiscoverySettings {
    /// Validates the settings and builds the engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unparsable subnet or address,
    /// or a zero interval.
    pub fn to_engine_config(&self) -> Result<DiscoveryConfig, ConfigError> {
        let subnets = self
            .subnets
            .iter()
            .map(|s| {
                s.parse::<Ipv4Subnet>().map_err(|e| ConfigError::Invalid {
                    field: "discovery.subnets",
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let ignored_addresses = self
            .ignored_addresses
            .iter()
            .map(|s| {
                s.parse::<IpAddr>().map_err(|e| ConfigError::Invalid {
                    field: "discovery.ignored_addresses",
                    reason: format!("{s:?}: {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        for (field, value) in [
            ("discovery.stale_timeout_secs", self.stale_timeout_secs),
            ("discovery.poll_interval_secs", self.poll_interval_secs),
            ("discovery.sweep_interval_secs", self.sweep_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least 1 second".to_string(),
                });
            }
        }

        Ok(DiscoveryConfig {
            strict_mode: self.strict_mode,
            ssh_port: self.ssh_port,
            webapp_port: self.webapp_port,
            subnets,
            ignored_addresses,
            stale_timeout: Duration::from_secs(self.stale_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            ..DiscoveryConfig::default()
        })
    }
}

impl SshSettings {
    /// Session parameters for `host`.  Passwords are filled in by the caller.
    pub fn session_config(&self, host: &str) -> SessionConfig {
        SessionConfig {
            host: host.to_string(),
            port: self.port,
            user: self.user.clone(),
            password: None,
            sudo_password: None,
            key_path: self.key_path.clone(),
            ssh_dir: default_ssh_dir(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            remote_dir: self.remote_dir.clone(),
            service_name: self.service_name.clone(),
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

/// Resolves the full path to the config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from its platform location, or defaults if the file
/// does not exist yet.
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

/// Writes `config` to `path`, creating the parent directory if needed.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
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

/// Resolves the platform config base directory including the application
/// subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("BjornManager"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("bjorn-manager"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("BjornManager")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_documented_values() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.manager.log_level, "info");
        assert!(!cfg.manager.show_device_gone);
        assert!(cfg.discovery.strict_mode);
        assert_eq!(cfg.discovery.webapp_port, 8000);
        assert_eq!(cfg.discovery.subnets, vec!["172.20.1.0/24", "172.20.2.0/24"]);
        assert_eq!(cfg.ssh.user, "bjorn");
        assert_eq!(cfg.ssh.service_name, "bjorn.service");
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_partial_section_overrides_only_given_keys() {
        // Arrange
        let toml_str = r#"
[discovery]
strict_mode = false
ignored_addresses = ["10.0.0.99"]

[ssh]
port = 2222
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert!(!cfg.discovery.strict_mode);
        assert_eq!(cfg.discovery.ssh_port, 22);
        assert_eq!(cfg.ssh.port, 2222);
        assert_eq!(cfg.ssh.user, "bjorn");
    }

    #[test]
    fn test_invalid_toml_returns_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[[[ not valid toml").unwrap();
        assert!(matches!(load_config_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.manager.log_level = "debug".to_string();
        cfg.ssh.key_path = Some(PathBuf::from("/keys/bjorn"));

        // Act
        save_config_to(&cfg, &path).unwrap();
        let loaded = load_config_from(&path).unwrap();

        // Assert
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_engine_config_parses_subnets_and_addresses() {
        let settings = DiscoverySettings {
            ignored_addresses: vec!["10.0.0.99".to_string()],
            stale_timeout_secs: 120,
            ..DiscoverySettings::default()
        };

        let engine = settings.to_engine_config().unwrap();

        assert_eq!(engine.subnets, vec![BLUETOOTH_SUBNET, USB_SUBNET]);
        assert_eq!(engine.ignored_addresses, vec!["10.0.0.99".parse::<IpAddr>().unwrap()]);
        assert_eq!(engine.stale_timeout, Duration::from_secs(120));
        assert_eq!(engine.sweep_workers, 24);
    }

    #[test]
    fn test_engine_config_rejects_bad_subnet() {
        let settings = DiscoverySettings {
            subnets: vec!["172.20.1.0/33".to_string()],
            ..DiscoverySettings::default()
        };
        assert!(matches!(
            settings.to_engine_config(),
            Err(ConfigError::Invalid { field: "discovery.subnets", .. })
        ));
    }

    #[test]
    fn test_engine_config_rejects_zero_interval() {
        let settings = DiscoverySettings {
            poll_interval_secs: 0,
            ..DiscoverySettings::default()
        };
        assert!(settings.to_engine_config().is_err());
    }

    #[test]
    fn test_session_config_carries_ssh_settings() {
        let settings = SshSettings {
            port: 2222,
            remote_dir: "/opt/bjorn".to_string(),
            ..SshSettings::default()
        };
        let session = settings.session_config("172.20.2.7");
        assert_eq!(session.host, "172.20.2.7");
        assert_eq!(session.port, 2222);
        assert_eq!(session.remote_dir, "/opt/bjorn");
        assert_eq!(session.connect_timeout, Duration::from_secs(15));
        assert!(session.password.is_none());
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with("config.toml"), "got {path:?}");
        }
    }
}
