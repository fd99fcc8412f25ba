//! Driver configuration management

use crate::manager::ManagerOptions;
use crate::minor::{DEFAULT_MINOR_BASE, MINOR_POOL_SIZE};
use anyhow::{Context, Result, anyhow};
use common::LOG_LEVELS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default device match: the OSR USB-FX2 learning kit
pub const DEFAULT_FILTER: &str = "0x0547:0x1002";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub driver: DriverSettings,
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    pub log_level: String,
    /// Bulk read timeout in milliseconds
    #[serde(default = "DriverSettings::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// First minor number handed out
    #[serde(default = "DriverSettings::default_minor_base")]
    pub minor_base: u32,
}

impl DriverSettings {
    fn default_read_timeout_ms() -> u64 {
        20
    }

    fn default_minor_base() -> u32 {
        DEFAULT_MINOR_BASE
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Devices to bind, as "0xVID:0xPID" or "0xVID:*"
    pub filters: Vec<String>,
    /// Interface to claim on each matching device
    #[serde(default)]
    pub interface: u8,
    /// Timeout of a single asynchronous bulk write in milliseconds
    #[serde(default = "UsbSettings::default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Granularity of the interrupt poll's blocking reads in milliseconds
    #[serde(default = "UsbSettings::default_interrupt_poll_ms")]
    pub interrupt_poll_ms: u64,
}

impl UsbSettings {
    fn default_write_timeout_ms() -> u64 {
        1000
    }

    fn default_interrupt_poll_ms() -> u64 {
        10 // Short, so cancellation is noticed quickly
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn interrupt_poll(&self) -> Duration {
        Duration::from_millis(self.interrupt_poll_ms)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver: DriverSettings {
                log_level: "info".to_string(),
                read_timeout_ms: DriverSettings::default_read_timeout_ms(),
                minor_base: DriverSettings::default_minor_base(),
            },
            usb: UsbSettings {
                filters: vec![DEFAULT_FILTER.to_string()],
                interface: 0,
                write_timeout_ms: UsbSettings::default_write_timeout_ms(),
                interrupt_poll_ms: UsbSettings::default_interrupt_poll_ms(),
            },
        }
    }
}

impl DriverConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/osrfx2/driver.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let config: DriverConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("osrfx2").join("driver.toml")
        } else {
            PathBuf::from(".config/osrfx2/driver.toml")
        }
    }

    /// Options for the device manager
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            read_timeout: Duration::from_millis(self.driver.read_timeout_ms),
            minor_base: self.driver.minor_base,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        if self.driver.read_timeout_ms == 0 {
            return Err(anyhow!("read_timeout_ms must be greater than zero"));
        }

        if self.driver.minor_base.checked_add(MINOR_POOL_SIZE).is_none() {
            return Err(anyhow!(
                "minor_base {} leaves no room for {} minors",
                self.driver.minor_base,
                MINOR_POOL_SIZE
            ));
        }

        if self.usb.write_timeout_ms == 0 || self.usb.interrupt_poll_ms == 0 {
            return Err(anyhow!(
                "write_timeout_ms and interrupt_poll_ms must be greater than zero"
            ));
        }

        if self.usb.filters.is_empty() {
            return Err(anyhow!("At least one USB filter is required"));
        }

        // Validate USB filters (VID:PID format)
        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x0547:0x1002' or '0x0547:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x0547')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Expand `~` in a user-supplied config path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
