//! CLI configuration management

use crate::inspector::MessageFormat;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use wsinspect_common::constants;

/// Get the configuration directory path
pub fn config_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("wsinspect")
    }

    #[cfg(not(target_os = "windows"))]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".wsinspect")
    }
}

/// Get the config file path
pub fn config_file() -> PathBuf {
    config_dir().join("config.yml")
}

/// Main configuration file structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Address the listener binds (default: 127.0.0.1:3030)
    #[serde(default = "default_address")]
    pub address: String,

    /// Port of the local control API (default: 3031)
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// How message payloads are shown
    #[serde(default)]
    pub format: MessageFormat,
}

fn default_address() -> String {
    constants::DEFAULT_LISTEN_ADDRESS.to_string()
}

fn default_control_port() -> u16 {
    constants::DEFAULT_CONTROL_PORT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            control_port: default_control_port(),
            format: MessageFormat::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(config_dir()).context("Failed to create config directory")?;
        self.save_to(&config_file())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Apply command line overrides
    pub fn with_overrides(
        mut self,
        address: Option<String>,
        control_port: Option<u16>,
        format: Option<MessageFormat>,
    ) -> Self {
        if let Some(address) = address {
            self.address = address;
        }
        if let Some(control_port) = control_port {
            self.control_port = control_port;
        }
        if let Some(format) = format {
            self.format = format;
        }
        self
    }
}
