//! Configuration file support for the bootrx CLI.
//!
//! Configuration is loaded from multiple sources with the following priority
//! (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BOOTRX_*)
//! 3. Local config file (./bootrx.toml)
//! 4. Global config file (~/.config/bootrx/config.toml)

use anyhow::{Context, Result};
use bootrx::{BootConfig, ConfirmPolicy, EraseLayout, FlashRegion, PreservedRange};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// A flash region in the config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegionConfig {
    /// First byte address.
    pub base: u32,
    /// Length in bytes.
    pub size: u32,
}

impl From<RegionConfig> for FlashRegion {
    fn from(r: RegionConfig) -> Self {
        FlashRegion::new(r.base, r.size)
    }
}

/// A preserved token range in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreservedConfig {
    /// First byte address.
    pub addr: u32,
    /// Length in bytes.
    pub len: u32,
    /// Purpose label for logs.
    #[serde(default)]
    pub purpose: String,
}

/// Device layout configuration for the hosted receiver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Flash page size in bytes.
    pub page_size: Option<u32>,
    /// Running loader version word.
    pub loader_version: Option<u32>,
    /// Running sub-processor version word.
    pub subproc_version: Option<u32>,
    /// Idle polls tolerated before a timeout reset.
    pub idle_timeout: Option<u32>,
    /// Keep a pending erase confirmation across unrelated commands.
    #[serde(default)]
    pub sticky_erase_confirm: bool,
    /// Application region.
    pub app: Option<RegionConfig>,
    /// Upgrade staging region.
    pub upgrade: Option<RegionConfig>,
    /// Live loader region.
    pub loader: Option<RegionConfig>,
    /// Live sub-processor region.
    pub subproc: Option<RegionConfig>,
    /// Erase-command span.
    pub erase_span: Option<RegionConfig>,
    /// Token ranges preserved across an erase.
    #[serde(default)]
    pub preserved: Vec<PreservedConfig>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Device layout settings.
    #[serde(default)]
    pub layout: LayoutConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new("bootrx.toml")) {
            debug!("Loaded local config from bootrx.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from an explicit path, falling back to defaults.
    pub fn load_from_path(path: &Path) -> Self {
        match Self::load_from_file(path) {
            Some(config) => config,
            None => {
                warn!("could not read config {}, using defaults", path.display());
                Self::default()
            },
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("ignoring malformed config {}: {e}", path.display());
                None
            },
        }
    }

    fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "bootrx").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        let layout = &mut self.layout;
        let incoming = other.layout;
        layout.page_size = incoming.page_size.or(layout.page_size);
        layout.loader_version = incoming.loader_version.or(layout.loader_version);
        layout.subproc_version = incoming.subproc_version.or(layout.subproc_version);
        layout.idle_timeout = incoming.idle_timeout.or(layout.idle_timeout);
        layout.sticky_erase_confirm |= incoming.sticky_erase_confirm;
        layout.app = incoming.app.or(layout.app);
        layout.upgrade = incoming.upgrade.or(layout.upgrade);
        layout.loader = incoming.loader.or(layout.loader);
        layout.subproc = incoming.subproc.or(layout.subproc);
        layout.erase_span = incoming.erase_span.or(layout.erase_span);
        if !incoming.preserved.is_empty() {
            layout.preserved = incoming.preserved;
        }
    }

    /// Build the receiver's [`BootConfig`] from the defaults plus overrides.
    pub fn boot_config(&self) -> Result<BootConfig> {
        let mut cfg = BootConfig::default();
        let layout = &self.layout;

        if let Some(page_size) = layout.page_size {
            cfg.page_size = page_size;
        }
        if let Some(v) = layout.loader_version {
            cfg.loader_version = v;
        }
        if let Some(v) = layout.subproc_version {
            cfg.subproc_version = v;
        }
        cfg.idle_timeout = layout.idle_timeout;
        cfg.confirm_policy = if layout.sticky_erase_confirm {
            ConfirmPolicy::KeepUntilConfirmed
        } else {
            ConfirmPolicy::ClearOnOtherCommand
        };
        if let Some(r) = layout.app {
            cfg.app_region = r.into();
        }
        if let Some(r) = layout.upgrade {
            cfg.upgrade_region = r.into();
        }
        if let Some(r) = layout.loader {
            cfg.loader_region = r.into();
        }
        if let Some(r) = layout.subproc {
            cfg.subproc_region = r.into();
        }
        cfg.erase = EraseLayout {
            span: layout.erase_span.map(Into::into),
            preserved: layout
                .preserved
                .iter()
                .map(|p| PreservedRange::new(p.addr, p.len, p.purpose.clone()))
                .collect(),
        };

        cfg.validate().context("invalid device layout configuration")?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds_valid_boot_config() {
        let cfg = Config::default().boot_config().unwrap();
        assert_eq!(cfg.packet_retry_budget, 60);
    }

    #[test]
    fn test_layout_overrides_apply() {
        let toml_str = r#"
            [connection]
            serial = "/dev/ttyUSB3"
            baud = 921600

            [layout]
            page_size = 256
            loader_version = 0x01040000
            idle_timeout = 120

            [layout.app]
            base = 0x2000
            size = 0x8000
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyUSB3"));

        let boot = config.boot_config().unwrap();
        assert_eq!(boot.page_size, 256);
        assert_eq!(boot.loader_version, 0x0104_0000);
        assert_eq!(boot.idle_timeout, Some(120));
        assert_eq!(boot.app_region.base, 0x2000);
    }

    #[test]
    fn test_malformed_file_is_ignored() {
        let dir = std::env::temp_dir().join("bootrx-config-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.toml");
        fs::write(&path, "not [valid toml").unwrap();
        assert!(Config::load_from_file(&path).is_none());
    }
}
