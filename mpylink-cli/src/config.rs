//! Configuration file support for mpylink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (MPYLINK_*)
//! 3. Local config file (./mpylink.toml)
//! 4. Global config file (<config dir>/mpylink/config.toml)
//!
//! `--config PATH` replaces steps 3 and 4.

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "mpylink.toml";

/// Connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionSection {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Default command timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// File transfer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferSection {
    /// Fixed chunk size for uploads.
    pub chunk_size: Option<usize>,
    /// Attempts per chunk.
    pub retry_attempts: Option<u32>,
    /// Read files back after upload.
    #[serde(default)]
    pub verify: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionSection,
    /// Transfer configuration.
    #[serde(default)]
    pub transfer: TransferSection,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global) = Self::global_config_path()
            .as_deref()
            .and_then(Self::load_from_file)
        {
            debug!("Loaded global config");
            config.merge(global);
        }

        // Local config overrides global
        if let Some(local) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match Self::parse(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Parse TOML text.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "mpylink").map(|dirs| {
            dirs.config_dir()
                .to_path_buf()
        })
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Set values in `other` win.
    fn merge(&mut self, other: Self) {
        let Self {
            connection,
            transfer,
        } = other;

        if connection.port.is_some() {
            self.connection.port = connection.port;
        }
        if connection.baud.is_some() {
            self.connection.baud = connection.baud;
        }
        if connection.timeout_ms.is_some() {
            self.connection.timeout_ms = connection.timeout_ms;
        }

        if transfer.chunk_size.is_some() {
            self.transfer.chunk_size = transfer.chunk_size;
        }
        if transfer.retry_attempts.is_some() {
            self.transfer.retry_attempts = transfer.retry_attempts;
        }
        if transfer.verify {
            self.transfer.verify = true;
        }
    }

    /// Configured command timeout.
    pub fn command_timeout(&self) -> Option<Duration> {
        self.connection
            .timeout_ms
            .map(Duration::from_millis)
    }

    /// Remember `port` in the local config file.
    pub fn remember_port(&mut self, port: &str) -> anyhow::Result<()> {
        let path = Path::new(LOCAL_CONFIG_FILE);
        let mut stored = Self::load_from_file(path).unwrap_or_default();
        stored.connection.port = Some(port.to_string());

        fs::write(path, toml::to_string_pretty(&stored)?)?;
        self.connection.port = Some(port.to_string());
        info!("Saved port {port} to {}", path.display());
        Ok(())
    }
}
