//! Configuration management for roomlink.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/roomlink/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::devices::DeviceIdentity;

/// Default MQTT-over-TLS port devices listen on.
pub const DEFAULT_DEVICE_PORT: u16 = 8883;

/// Address a device uses for itself while hosting its own access point.
pub const DEFAULT_AP_ADDRESS: &str = "192.168.10.1";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than 0")]
    InvalidPort(&'static str),

    #[error("discovery attempts must be greater than 0")]
    InvalidDiscoveryAttempts,

    #[error("{0} must be greater than 0 seconds")]
    InvalidTimeout(&'static str),

    #[error("mqtt channel_capacity must be greater than 0")]
    InvalidChannelCapacity,

    #[error("firmware_version must be 2 or 3, got {0}")]
    InvalidFirmwareVersion(u32),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// The device to talk to.
    pub device: DeviceConfig,

    /// MQTT session settings.
    pub mqtt: MqttConfig,

    /// UDP discovery settings.
    pub discovery: DiscoveryConfig,

    /// Access-point provisioning settings.
    pub provisioning: ProvisioningConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Address and credentials of one device.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// LAN address of the device.
    pub ip: String,

    /// MQTT-over-TLS port.
    pub port: u16,

    /// Device identifier, used as MQTT client id and username.
    pub blid: String,

    /// Access password in `:1:<seconds>:<token>` form.
    pub password: String,
}

/// MQTT session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,

    /// How long to wait for the connection acknowledgement.
    pub connect_timeout_secs: u64,

    /// Capacity of the request and fan-out channels.
    pub channel_capacity: usize,

    /// Topic filter used for status subscriptions.
    pub subscription_topic: String,
}

/// UDP discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Port devices listen on for discovery broadcasts.
    pub port: u16,

    /// Address broadcasts are sent to.
    pub broadcast_address: String,

    /// Number of broadcasts sent per discovery run.
    pub attempts: u32,

    /// Delay between broadcasts in milliseconds.
    pub send_interval_ms: u64,

    /// How long to collect replies, in seconds.
    pub timeout_secs: u64,
}

/// Access-point provisioning settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Device address while it hosts its own access point.
    pub ap_address: String,

    /// Port on the access-point address.
    pub ap_port: u16,

    /// Pause between Wi-Fi provisioning steps in milliseconds.
    pub step_delay_ms: u64,

    /// Firmware major version, selects the Wi-Fi credential encoding.
    pub firmware_version: u32,

    /// Read timeout for the credential exchange, in seconds.
    pub read_timeout_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ip: String::new(),
            port: DEFAULT_DEVICE_PORT,
            blid: String::new(),
            password: String::new(),
        }
    }
}

impl std::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("blid", &self.blid)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            channel_capacity: 64,
            subscription_topic: "#".to_string(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: protocol::DISCOVERY_PORT,
            broadcast_address: "255.255.255.255".to_string(),
            attempts: 5,
            send_interval_ms: 100,
            timeout_secs: 5,
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            ap_address: DEFAULT_AP_ADDRESS.to_string(),
            ap_port: DEFAULT_DEVICE_PORT,
            step_delay_ms: 1000,
            firmware_version: 3,
            read_timeout_secs: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("roomlink")
        .join("config.toml")
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Empty values are ignored. Supported variables:
    /// - ROOMLINK_IP, ROOMLINK_PORT, ROOMLINK_BLID, ROOMLINK_PASSWORD
    /// - ROOMLINK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Some(ip) = env_override("ROOMLINK_IP") {
            tracing::info!("Overriding device ip from environment: {}", ip);
            self.device.ip = ip;
        }

        if let Some(port) = env_override("ROOMLINK_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding device port from environment: {}", port);
                    self.device.port = port;
                }
                Err(_) => {
                    tracing::warn!("Ignoring invalid ROOMLINK_PORT value: {}", port);
                }
            }
        }

        if let Some(blid) = env_override("ROOMLINK_BLID") {
            tracing::info!("Overriding device blid from environment: {}", blid);
            self.device.blid = blid;
        }

        if let Some(password) = env_override("ROOMLINK_PASSWORD") {
            tracing::info!("Overriding device password from environment");
            self.device.password = password;
        }

        if let Some(level) = env_override("ROOMLINK_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.logging.log_level = level;
        }
    }

    /// Validate the configuration values.
    ///
    /// Device address and credentials are not checked here; commands that
    /// need them report a missing value themselves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.port == 0 {
            return Err(ConfigError::InvalidPort("device port"));
        }
        if self.discovery.port == 0 {
            return Err(ConfigError::InvalidPort("discovery port"));
        }
        if self.provisioning.ap_port == 0 {
            return Err(ConfigError::InvalidPort("provisioning ap_port"));
        }

        if self.discovery.attempts == 0 {
            return Err(ConfigError::InvalidDiscoveryAttempts);
        }
        if self.discovery.timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("discovery timeout_secs"));
        }
        if self.mqtt.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("mqtt connect_timeout_secs"));
        }
        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidTimeout("mqtt keep_alive_secs"));
        }
        if self.provisioning.read_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("provisioning read_timeout_secs"));
        }
        if self.mqtt.channel_capacity == 0 {
            return Err(ConfigError::InvalidChannelCapacity);
        }

        if !(2..=3).contains(&self.provisioning.firmware_version) {
            return Err(ConfigError::InvalidFirmwareVersion(
                self.provisioning.firmware_version,
            ));
        }

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }

        Ok(())
    }

    /// Builds the device identity from the `[device]` section.
    pub fn device_identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(
            self.device.blid.clone(),
            self.device.ip.clone(),
            self.device.port,
            self.device.password.clone(),
        )
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
