//! Daemon Configuration
//!
//! TOML configuration for the `peerlink` command, stored at
//! `$XDG_CONFIG_HOME/peerlink/peerlink.toml` unless `--config` points
//! elsewhere.

use anyhow::{Context, Result};
use peerlink_protocol::discovery::SubscribeInfo;
use peerlink_protocol::ManagerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "peerlink.toml";
const REGISTRY_FILE: &str = "trusted_devices.json";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local device identity
    pub device: DeviceConfig,

    /// Subscribe parameters used by `discover` and `pair`
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Pairing timings and request fields
    #[serde(default)]
    pub pairing: PairingConfig,

    /// Storage paths
    pub paths: PathConfig,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name
    pub name: String,

    /// Device type id as reported to peers
    #[serde(default = "default_device_type_id")]
    pub device_type_id: u16,

    /// Device ID (auto-generated if not set)
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Discovery configuration
///
/// Values are kept raw here and validated when turned into a [`SubscribeInfo`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// `0x55` passive or `0xAA` active
    #[serde(default = "default_mode")]
    pub mode: i32,

    /// `0` auto, `1` BLE, `2` CoAP, `3` USB
    #[serde(default = "default_medium")]
    pub medium: i32,

    /// `0` low through `3` super high
    #[serde(default = "default_freq")]
    pub freq: i32,

    #[serde(default)]
    pub is_same_account: bool,

    #[serde(default = "default_true")]
    pub is_wake_remote: bool,

    /// `0` DDMP, `1` OSD
    #[serde(default)]
    pub capability: i32,
}

/// Pairing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Countdown for PIN display, PIN entry and approval in seconds
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,

    /// Authentication param polling interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Application name sent with pairing requests
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Data directory (trusted device registry)
    pub data_dir: PathBuf,
}

fn default_device_type_id() -> u16 {
    // Desktop
    0x0C
}

fn default_mode() -> i32 {
    0xAA
}

fn default_medium() -> i32 {
    2
}

fn default_freq() -> i32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_auth_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_app_name() -> String {
    "peerlink".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            medium: default_medium(),
            freq: default_freq(),
            is_same_account: false,
            is_wake_remote: default_true(),
            capability: 0,
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: default_auth_timeout(),
            poll_interval_ms: default_poll_interval(),
            app_name: default_app_name(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = default_config_dir();
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("peerlink");

        Self {
            device: DeviceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                device_type_id: default_device_type_id(),
                device_id: None,
            },
            discovery: DiscoveryConfig::default(),
            pairing: PairingConfig::default(),
            paths: PathConfig {
                config_dir,
                data_dir,
            },
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("peerlink")
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        default_config_dir().join(CONFIG_FILE)
    }

    /// Load configuration from `path`, creating a default file if missing
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.data_dir).context("Failed to create data directory")?;
        Ok(())
    }

    /// Reject values the library would refuse later
    pub fn validate(&self) -> Result<()> {
        self.subscribe_info(0).context("Invalid [discovery] section")?;
        if self.pairing.auth_timeout_secs == 0 {
            anyhow::bail!("pairing.auth_timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Subscribe parameters for a discovery session
    pub fn subscribe_info(&self, subscribe_id: u16) -> Result<SubscribeInfo> {
        let discovery = &self.discovery;
        let info = SubscribeInfo::from_raw(
            i64::from(subscribe_id),
            discovery.mode,
            discovery.medium,
            discovery.freq,
            discovery.is_same_account,
            discovery.is_wake_remote,
            discovery.capability,
        )?;
        Ok(info)
    }

    /// Path of the trusted device registry
    pub fn registry_path(&self) -> PathBuf {
        self.paths.data_dir.join(REGISTRY_FILE)
    }

    /// Library configuration for a device manager
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            registry_path: Some(self.registry_path()),
            auth_timeout: Duration::from_secs(self.pairing.auth_timeout_secs),
            poll_interval: Duration::from_millis(self.pairing.poll_interval_ms),
        }
    }
}
